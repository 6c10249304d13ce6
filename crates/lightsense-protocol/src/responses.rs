//! Classification of response lines.
//!
//! The firmware answers every command with a single line. Most lines are one
//! of a small set of sentinels; the rest carry a payload (a number for reads
//! and samples).

use std::fmt;

/// A classified response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `OK`.
    Ok,
    /// `ERROR`, or a longer line containing it. Holds the trimmed line.
    Error(String),
    /// `NA` or `NONE`: the requested value is not set.
    NotAvailable,
    /// `NO_CONF_SELECTED`: measurement requested without a selected channel.
    NoConfigSelected,
    /// `CHECK_FAILED`: the supply voltage check failed before sampling.
    CheckFailed,
    /// `TRUE`.
    True,
    /// `FALSE`.
    False,
    /// `ERRORS_CLEARED`: pending errors were cleared by `meas_stop`.
    ErrorsCleared,
    /// A numeric payload, kept as text so integer values stay exact.
    Numeric(String),
    /// Anything else.
    Text(String),
    /// No line (an empty line, or no line before the deadline).
    Empty,
}

impl Response {
    /// Classify a raw line.
    ///
    /// Sentinels are matched as the whole trimmed line first. Only the
    /// error-family sentinels also match when embedded in a longer line, and
    /// they win over a numeric payload.
    pub fn parse(line: &str) -> Response {
        let text = line.trim();
        if text.is_empty() {
            return Response::Empty;
        }

        match text {
            "OK" => return Response::Ok,
            "ERROR" => return Response::Error(text.to_string()),
            "NA" | "NONE" => return Response::NotAvailable,
            "NO_CONF_SELECTED" => return Response::NoConfigSelected,
            "CHECK_FAILED" => return Response::CheckFailed,
            "TRUE" => return Response::True,
            "FALSE" => return Response::False,
            "ERRORS_CLEARED" => return Response::ErrorsCleared,
            _ => {}
        }

        if text.contains("CHECK_FAILED") {
            return Response::CheckFailed;
        }
        if text.contains("NO_CONF_SELECTED") {
            return Response::NoConfigSelected;
        }
        if text.contains("ERROR") {
            return Response::Error(text.to_string());
        }

        if text.parse::<f64>().is_ok_and(f64::is_finite) {
            return Response::Numeric(text.to_string());
        }

        // A prompt or echo may precede the acknowledgement on the same line.
        if text.split_whitespace().any(|word| word == "OK") {
            return Response::Ok;
        }

        Response::Text(text.to_string())
    }

    /// Classify raw bytes. Invalid UTF-8 is replaced rather than rejected.
    pub fn from_bytes(line: &[u8]) -> Response {
        Response::parse(&String::from_utf8_lossy(line))
    }

    /// Check if this is an `OK` acknowledgement.
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok)
    }

    /// Check if this is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }

    /// Check if nothing was received.
    pub fn is_empty(&self) -> bool {
        matches!(self, Response::Empty)
    }

    /// The numeric payload as a float, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Response::Numeric(text) => text.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => f.write_str("OK"),
            Response::Error(text) | Response::Numeric(text) => f.write_str(text),
            Response::NotAvailable => f.write_str("NA"),
            Response::NoConfigSelected => f.write_str("NO_CONF_SELECTED"),
            Response::CheckFailed => f.write_str("CHECK_FAILED"),
            Response::True => f.write_str("TRUE"),
            Response::False => f.write_str("FALSE"),
            Response::ErrorsCleared => f.write_str("ERRORS_CLEARED"),
            Response::Text(text) => write!(f, "{:?}", text),
            Response::Empty => f.write_str("<empty>"),
        }
    }
}

/// Typed conversion of a value-carrying response.
///
/// Returns `None` when the response does not have the expected shape.
/// `NA`/`NONE` never reach the converter; the client maps them to an absent
/// value first.
pub trait FromResponse: Sized {
    /// Name of the expected payload, used in error messages.
    const EXPECTED: &'static str;

    /// Convert the response.
    fn from_response(response: &Response) -> Option<Self>;
}

macro_rules! numeric_from_response {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl FromResponse for $ty {
                const EXPECTED: &'static str = $name;

                fn from_response(response: &Response) -> Option<Self> {
                    match response {
                        Response::Numeric(text) => text.parse().ok(),
                        _ => None,
                    }
                }
            }
        )*
    };
}

numeric_from_response! {
    u8 => "integer",
    u16 => "integer",
    i16 => "integer",
    i32 => "integer",
    f64 => "number",
}

impl FromResponse for bool {
    const EXPECTED: &'static str = "TRUE or FALSE";

    fn from_response(response: &Response) -> Option<Self> {
        match response {
            Response::True => Some(true),
            Response::False => Some(false),
            _ => None,
        }
    }
}
