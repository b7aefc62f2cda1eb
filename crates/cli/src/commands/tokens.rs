//! `nosrelay tokens`: count tokens with the planner's tokenizer.

use nosrelay_core::tokenizer;

pub async fn run(model: &str, text: &str) -> Result<(), Box<dyn std::error::Error>> {
    let count = tokenizer::count(text, model)?;
    println!("{count}");
    Ok(())
}
