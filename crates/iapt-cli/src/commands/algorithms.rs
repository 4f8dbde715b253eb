//! Algorithms command implementation

use anyhow::{Context, Result};

use iapt_core::AlgorithmCategory;
use iapt_ssh::transport;

use crate::output::format_algorithms;

/// Print the algorithms the transport can negotiate
pub fn algorithms_command(category: Option<AlgorithmCategory>) -> Result<()> {
    let catalog = transport::initialize().context("SSH transport unavailable")?;

    let categories = match category {
        Some(category) => vec![category],
        None => AlgorithmCategory::ALL.to_vec(),
    };

    println!("{}", format_algorithms(catalog, &categories));
    Ok(())
}
