use serde::{Deserialize, Serialize};

/// One weather sample as published by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub latitude: f64,
    pub longitude: f64,
    pub temperature: f64,
    pub humidity: f64,
    #[serde(rename = "is_day")]
    pub is_daylight: i64,
    pub precipitation: f64,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("reading must be a JSON object")]
    NotAnObject,
    #[error("malformed reading: {0}")]
    Malformed(#[from] simd_json::Error),
}

/// Structural decode only: every key must be present and well-typed, values are not range checked.
pub fn decode(payload: &[u8]) -> Result<Reading, DecodeError> {
    // Serde also accepts a positional array for a struct; readings are keyed only.
    match payload.iter().find(|byte| !byte.is_ascii_whitespace()) {
        None => return Err(DecodeError::Empty),
        Some(b'{') => {}
        Some(_) => return Err(DecodeError::NotAnObject),
    }
    // simd-json parses in place; the caller keeps the original bytes.
    let mut scratch = payload.to_vec();
    let reading: Reading = simd_json::serde::from_slice(&mut scratch)?;
    Ok(reading)
}

pub fn encode(reading: &Reading) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(reading)
}
