//! The `grpc-timeout` header codec.
//!
//! A timeout is a run of ASCII digits followed by a single unit letter:
//! `H`, `M`, `S` for hours, minutes and seconds, `m`, `u`, `n` for milli,
//! micro and nanoseconds. The integer part is at most eight digits.

use std::time::Duration;

use crate::error::ProtocolError;

/// Largest integer the header format allows.
const MAX_TIMEOUT_VALUE: u128 = 99_999_999;

/// Units, largest first, as (nanoseconds, suffix).
const UNITS: [(u128, char); 6] = [
    (3_600_000_000_000, 'H'),
    (60_000_000_000, 'M'),
    (1_000_000_000, 'S'),
    (1_000_000, 'm'),
    (1_000, 'u'),
    (1, 'n'),
];

/// Parse a `grpc-timeout` header value.
///
/// Rejects empty values, non-digit prefixes and unknown units with
/// [`ProtocolError::InvalidDeadline`]. A zero timeout is legal and yields
/// an immediately expired deadline.
pub fn parse_timeout(value: &[u8]) -> Result<Duration, ProtocolError> {
    let invalid = || ProtocolError::InvalidDeadline(String::from_utf8_lossy(value).into_owned());

    if value.len() < 2 {
        return Err(invalid());
    }

    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }

    // All-digit input, so this is valid UTF-8 and parses unless it overflows.
    let count: u64 = std::str::from_utf8(digits)
        .map_err(|_| invalid())?
        .parse()
        .map_err(|_| invalid())?;

    let nanos_per_unit = UNITS
        .iter()
        .find(|(_, suffix)| unit[0] == *suffix as u8)
        .map(|(nanos, _)| *nanos)
        .ok_or_else(invalid)?;

    u64::try_from(count as u128 * nanos_per_unit)
        .map(Duration::from_nanos)
        .map_err(|_| invalid())
}

/// Format a timeout for the `grpc-timeout` header.
///
/// Picks the largest unit in which the duration is a whole number of at
/// most eight digits, so parsing the result restores the duration exactly.
/// Durations exact in no unit fall back to the smallest unit that fits,
/// rounded up.
pub fn serialize_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();

    for (per, suffix) in UNITS {
        if nanos % per == 0 && nanos / per <= MAX_TIMEOUT_VALUE {
            return format!("{}{}", nanos / per, suffix);
        }
    }

    for (per, suffix) in UNITS.iter().rev() {
        let count = nanos.div_ceil(*per);
        if count <= MAX_TIMEOUT_VALUE {
            return format!("{}{}", count, suffix);
        }
    }

    format!("{}H", MAX_TIMEOUT_VALUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        let cases: [(&[u8], Duration); 6] = [
            (b"2H", Duration::from_secs(2 * 3600)),
            (b"3M", Duration::from_secs(180)),
            (b"7S", Duration::from_secs(7)),
            (b"100m", Duration::from_millis(100)),
            (b"250u", Duration::from_micros(250)),
            (b"500n", Duration::from_nanos(500)),
        ];

        for (header, expected) in cases {
            assert_eq!(parse_timeout(header).unwrap(), expected);
        }
    }

    #[test]
    fn zero_is_legal() {
        assert_eq!(parse_timeout(b"0S").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_values() {
        let cases: [&[u8]; 7] = [b"", b"S", b"5", b"5x", b"abcS", b"-5S", b"1.5S"];

        for header in cases {
            assert!(
                matches!(parse_timeout(header), Err(ProtocolError::InvalidDeadline(_))),
                "{:?}",
                header
            );
        }
    }

    #[test]
    fn serialize_picks_the_largest_exact_unit() {
        let cases = [
            (Duration::from_secs(3600), "1H"),
            (Duration::from_secs(90), "90S"),
            (Duration::from_millis(100), "100m"),
            (Duration::from_millis(1500), "1500m"),
            (Duration::from_nanos(1), "1n"),
            (Duration::ZERO, "0H"),
        ];

        for (timeout, expected) in cases {
            assert_eq!(serialize_timeout(timeout), expected);
        }
    }

    #[test]
    fn round_trip_is_exact() {
        let samples = [
            Duration::ZERO,
            Duration::from_nanos(1),
            Duration::from_nanos(123_456_789),
            Duration::from_micros(250),
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(86_400),
            Duration::new(2, 500_000_000),
        ];

        for timeout in samples {
            let header = serialize_timeout(timeout);
            assert_eq!(parse_timeout(header.as_bytes()).unwrap(), timeout, "{}", header);
        }
    }

    #[test]
    fn oversized_durations_round_up_to_a_fitting_unit() {
        // 99_999_999 seconds and change does not fit the seconds field
        // exactly, so the value rounds up in a coarser unit.
        let timeout = Duration::new(99_999_999, 1);
        let header = serialize_timeout(timeout);
        let parsed = parse_timeout(header.as_bytes()).unwrap();
        assert!(parsed >= timeout);
    }
}
