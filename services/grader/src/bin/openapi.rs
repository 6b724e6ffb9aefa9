//! services/grader/src/bin/openapi.rs
//!
//! Dumps the grader's REST contract as pretty-printed OpenAPI JSON.
//!
//! Usage: `openapi [PATH]`. PATH defaults to `openapi.json`; `-` writes to stdout.

use grader_lib::web::rest::ApiDoc;
use std::io::Write;
use utoipa::OpenApi;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let target = std::env::args().nth(1).unwrap_or_else(|| "openapi.json".to_string());
    let document = ApiDoc::openapi().to_pretty_json()?;

    if target == "-" {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(document.as_bytes())?;
        stdout.write_all(b"\n")?;
    } else {
        std::fs::write(&target, document)?;
        eprintln!("Wrote the grader API description to {}", target);
    }
    Ok(())
}
