//! OpenAPI export command.

use clap::Args;
use std::fs;
use std::path::PathBuf;
use utoipa::OpenApi;

use catapult_node::{ApiDoc, Error};

/// Export the OpenAPI document as JSON.
#[derive(Args, Debug)]
pub struct OpenapiCmd {
    /// Output file path (defaults to stdout).
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl OpenapiCmd {
    pub fn run(&self) -> catapult_node::Result<()> {
        let output = ApiDoc::openapi()
            .to_pretty_json()
            .map_err(|e| Error::configuration("serialize openapi", e.to_string()))?;

        match &self.output {
            Some(path) => {
                fs::write(path, &output).map_err(|e| {
                    Error::configuration("write openapi", format!("{}: {}", path.display(), e))
                })?;
                eprintln!("OpenAPI document written to {}", path.display());
            }
            None => {
                println!("{}", output);
            }
        }

        Ok(())
    }
}
