use std::fs;
use std::path::PathBuf;

/// Write the OpenAPI document to the given path (default `openapi.json`).
fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("openapi.json"));
    let port = std::env::var("APP_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8000);

    let doc = printshop_authz::docs::build_openapi(port);
    fs::write(&path, serde_json::to_string_pretty(&doc)?)?;
    println!("wrote {}", path.display());
    Ok(())
}
