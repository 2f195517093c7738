/// Kubernetes resource quantity parsing (`250m`, `64Mi`, `1.5G`, `2e3`)
///
/// Only used to validate user input and compare requests against limits;
/// the original string is what gets sent to the API server.

const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a quantity into its value in base units, `None` if malformed
pub fn parse_quantity(input: &str) -> Option<f64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let (number, multiplier) = split_suffix(s)?;
    if number.is_empty() {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value * multiplier)
}

fn split_suffix(s: &str) -> Option<(&str, f64)> {
    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return Some((number, *multiplier));
        }
    }

    // Decimal exponent form: 1e3, 2E6
    if let Some(pos) = s.find(['e', 'E']) {
        let (mantissa, exponent) = (&s[..pos], &s[pos + 1..]);
        let numeric = |c: char| c.is_ascii_digit() || c == '-' || c == '+';
        if !exponent.is_empty() && exponent.chars().all(numeric) {
            let exp: i32 = exponent.parse().ok()?;
            return Some((mantissa, 10f64.powi(exp)));
        }
    }

    for (suffix, multiplier) in DECIMAL_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return Some((number, *multiplier));
        }
    }

    if s.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '+' || c == '-') {
        return Some((s, 1.0));
    }
    None
}
