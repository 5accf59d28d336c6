use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Git metadata isn't available when the crate is built by `cargo install`, so only the cargo
    // target and profile info is emitted
    EmitBuilder::builder().all_cargo().emit()?;

    Ok(())
}
