//! JSON bodies for the edit endpoints.
//!
//! Browser clients often send numbers as strings (form fields), so numeric
//! parameters accept either. Required fields are `Option` here and checked
//! with [`required`], so a missing field is a 400 with a readable message
//! instead of a serde rejection.

use serde::de::{self, Deserializer};
use serde::Deserialize;

use super::AppError;
use crate::catalog::graph::num;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TrimBody {
    pub filename: Option<String>,
    #[serde(default, deserialize_with = "number_like")]
    pub start_time: Option<f64>,
    #[serde(default, deserialize_with = "number_like")]
    pub end_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct FilterBody {
    pub filename: Option<String>,
    pub filter: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TextBody {
    pub filename: Option<String>,
    pub text: Option<String>,
    #[serde(default, deserialize_with = "number_like")]
    pub font_size: Option<f64>,
    pub font_color: Option<String>,
    #[serde(default, deserialize_with = "expression_like")]
    pub x: Option<String>,
    #[serde(default, deserialize_with = "expression_like")]
    pub y: Option<String>,
    #[serde(default, deserialize_with = "number_like")]
    pub start_time: Option<f64>,
    #[serde(default, deserialize_with = "number_like")]
    pub end_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct MergeBody {
    pub filenames: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(super) struct AudioBody {
    pub filename: Option<String>,
    pub operation: Option<String>,
    #[serde(default, deserialize_with = "number_like")]
    pub volume: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

fn number_like<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(value)) => Ok(Some(value)),
        Some(NumberOrText::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(NumberOrText::Text(text)) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a number, got {text:?}"))),
    }
}

/// Positions may be plain numbers or drawtext expressions.
fn expression_like<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        match Option::<NumberOrText>::deserialize(deserializer)? {
            None => None,
            Some(NumberOrText::Number(value)) => Some(num(value)),
            Some(NumberOrText::Text(text)) if text.trim().is_empty() => None,
            Some(NumberOrText::Text(text)) => Some(text.trim().to_string()),
        },
    )
}

pub(super) fn required<T>(value: Option<T>, field: &str) -> Result<T, AppError> {
    value.ok_or_else(|| AppError::BadRequest(format!("{field} is required")))
}

/// Out-of-range sizes map to 0 so overlay validation rejects them.
pub(super) fn font_size(size: f64) -> u32 {
    if size.is_finite() && size >= 1.0 && size <= u32::MAX as f64 {
        size.round() as u32
    } else {
        0
    }
}
