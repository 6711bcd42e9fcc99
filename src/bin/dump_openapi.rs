use std::fs;

/// Writes the OpenAPI document to the path given as the first argument.
fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "openapi.json".to_string());
    let doc = org_scope::docs::build_openapi(8000);
    fs::write(&path, serde_json::to_string_pretty(&doc)?)?;
    println!("wrote {path}");
    Ok(())
}
