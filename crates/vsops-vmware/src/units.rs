//! Unit conversions applied once, at the parameter edge.

use vsops_core::{VsError, VsResult};

pub const MB: u64 = 1024 * 1024;

/// Parse a capacity such as `"10GB"`, `"512 mb"` or `"2TB"` into megabytes.
/// A bare number is megabytes.
pub fn parse_capacity_mb(input: &str) -> VsResult<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| VsError::protocol(format!("invalid capacity '{input}'")))?;
    let factor = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "m" | "mb" => 1,
        "g" | "gb" => 1024,
        "t" | "tb" => 1024 * 1024,
        other => {
            return Err(VsError::protocol(format!(
                "invalid capacity unit '{other}' in '{input}' (expected MB, GB or TB)"
            )))
        }
    };
    amount
        .checked_mul(factor)
        .filter(|mb| *mb > 0)
        .ok_or_else(|| VsError::protocol(format!("capacity '{input}' is out of range")))
}

/// DRS migration threshold: users say 1 (conservative) to 5 (aggressive);
/// the server stores 1 as most aggressive.
pub fn drs_rate_to_server(user: u8) -> VsResult<i64> {
    if !(1..=5).contains(&user) {
        return Err(VsError::protocol(format!(
            "drs_vmotion_rate must be between 1 and 5, got {user}"
        )));
    }
    Ok(6 - i64::from(user))
}

pub fn drs_rate_from_server(server: i64) -> i64 {
    6 - server
}

pub fn bytes_to_mb(bytes: i64) -> i64 {
    bytes / MB as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsops_core::ErrorKind;

    #[test]
    fn capacities() {
        assert_eq!(parse_capacity_mb("512").unwrap(), 512);
        assert_eq!(parse_capacity_mb("10GB").unwrap(), 10240);
        assert_eq!(parse_capacity_mb("2 tb").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_capacity_mb("64mb").unwrap(), 64);
    }

    #[test]
    fn bad_capacities() {
        for bad in ["", "GB", "10PB", "0", "-1GB"] {
            let err = parse_capacity_mb(bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::ProtocolFailure, "{bad}");
        }
    }

    #[test]
    fn drs_rate_is_inverted() {
        assert_eq!(drs_rate_to_server(5).unwrap(), 1);
        assert_eq!(drs_rate_to_server(1).unwrap(), 5);
        assert_eq!(drs_rate_from_server(drs_rate_to_server(3).unwrap()), 3);
        assert!(drs_rate_to_server(0).is_err());
        assert!(drs_rate_to_server(6).is_err());
    }

    #[test]
    fn bytes() {
        assert_eq!(bytes_to_mb(3 * MB as i64), 3);
    }
}
