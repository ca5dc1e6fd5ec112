// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Helpers for handling tunnel access tokens

/// Scheme prefix the agent expects in the tunnel authorization header
pub const TOKEN_SCHEME: &str = "tunnel";

/// Obfuscate a token for logging (show only last 4 characters)
/// Example: "abc123def456" -> "********f456"
pub fn obfuscate_token(token: &str) -> String {
    let len = token.chars().count();
    if len < 4 {
        "*".repeat(len)
    } else {
        let visible: String = token.chars().skip(len - 4).collect();
        format!("{}{}", "*".repeat(len - 4), visible)
    }
}

/// Header value for a connect token: `tunnel <token>`
pub fn authorization_value(token: &str) -> String {
    format!("{} {}", TOKEN_SCHEME, token)
}
