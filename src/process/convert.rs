use crate::process::{date_parser, utils};
use crate::schema::{ColumnSpec, ColumnType, Value};

/// Coerce one raw field to its column's type.
///
/// `Ok(None)` means the field is missing (empty after cleaning, or a "no
/// date" marker); `Err` carries the reason the value could not be coerced.
pub fn coerce(raw: &str, spec: &ColumnSpec) -> Result<Option<Value>, String> {
    let s = utils::clean_str(raw);
    if s.is_empty() {
        return Ok(None);
    }

    match spec.ty {
        ColumnType::Text => Ok(Some(Value::Text(s.to_string()))),

        ColumnType::Integer => s
            .parse::<i64>()
            .map(|v| Some(Value::Integer(v)))
            .map_err(|_| format!("`{s}` is not an integer")),

        // "1000,00" → 1000.0; a value with both separators is "1.000,00".
        ColumnType::Real => {
            let normalized = if s.contains(',') {
                s.replace('.', "").replace(',', ".")
            } else {
                s.to_string()
            };
            normalized
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| Some(Value::Real(v)))
                .ok_or_else(|| format!("`{s}` is not a number"))
        }

        ColumnType::Date => Ok(date_parser::parse_rfb_date(s)?
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))),

        ColumnType::FixedWidth => {
            let width = spec.width.unwrap_or(0);
            if !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("`{s}` is not a digit string"));
            }
            if s.len() > width {
                return Err(format!("`{s}` is wider than {width} digits"));
            }
            Ok(Some(Value::Text(format!("{s:0>width$}"))))
        }
    }
}
