//! Turning command-line input into raw instruction bytes.
//!
//! Input is either a hex string (with or without `0x`, whitespace ignored) or a file named
//! with a leading `@`. Files ending in `.hex` are read as hex text, anything else as raw
//! machine code.

use shapeshift_utils::errors::CliError;
use std::fs;
use std::path::Path;

/// Strips an optional `0x` prefix and all whitespace from a hex string.
pub fn normalize_hex_string(input: &str) -> String {
    let trimmed = input.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    body.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Decodes a hex string into bytes.
pub fn hex_to_bytes(input: &str) -> Result<Vec<u8>, CliError> {
    Ok(hex::decode(normalize_hex_string(input))?)
}

/// Resolves a command-line input argument to bytes.
pub fn input_to_bytes(input: &str) -> Result<Vec<u8>, CliError> {
    let Some(path) = input.strip_prefix('@') else {
        return hex_to_bytes(input);
    };
    let path = Path::new(path);
    let contents = fs::read(path).map_err(|source| CliError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    if path.extension().is_some_and(|ext| ext == "hex") {
        let text = String::from_utf8_lossy(&contents);
        return hex_to_bytes(&text);
    }
    Ok(contents)
}

/// Parses an address given as `0x`-prefixed hex or decimal.
pub fn parse_address(value: &str) -> Result<u64, CliError> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| CliError::InvalidArgument(format!("bad address '{value}': {err}")))
}

/// Parses a comma-separated list of addresses.
pub fn parse_address_list(value: &str) -> Result<Vec<u64>, CliError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_address)
        .collect()
}
