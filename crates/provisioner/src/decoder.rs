// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

//! Decoding of agent output
//!
//! Empty output means the queried resource does not exist and decodes to
//! `None`. Output that is present but not valid JSON is a [`Error::Decode`],
//! never `None`, since it points at an incompatible agent release.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;

use devtunnel_common::{
    AccessDescriptor, AccessListEnvelope, Error, PortDescriptor, PortEnvelope, Result,
    TunnelDescriptor, TunnelEnvelope, TunnelListEnvelope, TunnelSummary, UserDescriptor,
};

/// Banner printed by `devtunnel --version`
const VERSION_BANNER: &str = "Tunnel CLI version:";

/// Decode raw agent output into `T`
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<Option<T>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| Error::Decode(format!("{} (output: {})", e, excerpt(raw))))
}

/// Tunnel descriptor from `show`/`create`; an empty id counts as absent
pub fn decode_tunnel(raw: &str) -> Result<Option<TunnelDescriptor>> {
    Ok(decode::<TunnelEnvelope>(raw)?
        .and_then(|envelope| envelope.tunnel)
        .filter(|tunnel| !tunnel.tunnel_id.trim().is_empty()))
}

/// Port descriptor from `port show`/`port create`; an empty tunnel id counts
/// as absent
pub fn decode_port(raw: &str) -> Result<Option<PortDescriptor>> {
    Ok(decode::<PortEnvelope>(raw)?
        .and_then(|envelope| envelope.port)
        .filter(|port| !port.tunnel_id.trim().is_empty()))
}

/// Connect token from `token`
///
/// Errors report where decoding failed but never echo the output, which
/// carries the token.
pub fn decode_access(raw: &str) -> Result<Option<AccessDescriptor>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    serde_json::from_str(raw).map(Some).map_err(|e| {
        Error::Decode(format!(
            "{:?} error at line {} column {} (output withheld)",
            e.classify(),
            e.line(),
            e.column()
        ))
    })
}

/// Access control entries from `access list`; absent output means none
pub fn decode_access_list(raw: &str) -> Result<AccessListEnvelope> {
    Ok(decode::<AccessListEnvelope>(raw)?.unwrap_or_default())
}

/// Tunnels owned by the signed-in user, from `list`
pub fn decode_tunnel_list(raw: &str) -> Result<Vec<TunnelSummary>> {
    Ok(decode::<TunnelListEnvelope>(raw)?
        .map(|envelope| envelope.tunnels)
        .unwrap_or_default()
        .into_iter()
        .filter(|tunnel| !tunnel.tunnel_id.trim().is_empty())
        .collect())
}

pub fn decode_user(raw: &str) -> Result<Option<UserDescriptor>> {
    decode::<UserDescriptor>(raw)
}

/// Extract the version from `--version` output
pub fn parse_cli_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix(VERSION_BANNER)
            .map(|version| version.trim().to_string())
    })
}

/// When a connect token stops being valid
///
/// Prefers the absolute `expiration`; falls back to `lifetime` counted from
/// `now`. `None` when neither can be read.
pub fn token_expiry(access: &AccessDescriptor, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(expiration) = access.expiration.as_deref() {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(expiration.trim()) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    access
        .lifetime
        .as_deref()
        .and_then(parse_timespan)
        .map(|lifetime| now + lifetime)
}

/// Parse a `[d.]hh:mm:ss[.fffffff]` span
fn parse_timespan(value: &str) -> Option<Duration> {
    let value = value.trim();
    let mut parts = value.split(':');
    let (hours_part, minutes, seconds) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let (days, hours) = match hours_part.split_once('.') {
        Some((days, hours)) => (days.parse::<i64>().ok()?, hours.parse::<i64>().ok()?),
        None => (0, hours_part.parse::<i64>().ok()?),
    };
    let minutes = minutes.parse::<i64>().ok()?;
    // Fractional seconds are dropped
    let seconds = seconds.split('.').next()?.parse::<i64>().ok()?;

    if hours > 23 || minutes > 59 || seconds > 59 || days < 0 || hours < 0 {
        return None;
    }

    Some(
        Duration::days(days)
            + Duration::hours(hours)
            + Duration::minutes(minutes)
            + Duration::seconds(seconds),
    )
}

fn excerpt(raw: &str) -> String {
    const MAX: usize = 120;
    if raw.chars().count() <= MAX {
        raw.to_string()
    } else {
        let head: String = raw.chars().take(MAX).collect();
        format!("{}...", head)
    }
}
