// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Parses a human-readable size string like `4k`, `8 MB` or `32 PB`.
///
/// Accepted shape: digits, an optional single space, one of `k m g t p`
/// (either case), an optional trailing `B`. The multiplier is `1024^n`.
/// Anything else parses to 0.
#[must_use]
pub fn parse_human_size(s: &str) -> u64 {
    let rest = s.trim_start_matches(|c: char| c.is_ascii_digit());
    let digits = s.get(..s.len() - rest.len()).unwrap_or_default();

    let Ok(count) = digits.parse::<u64>() else {
        return 0;
    };

    let rest = rest.strip_prefix(' ').unwrap_or(rest);

    let mut chars = rest.chars();

    let exponent = match chars.next() {
        Some('k' | 'K') => 1,
        Some('m' | 'M') => 2,
        Some('g' | 'G') => 3,
        Some('t' | 'T') => 4,
        Some('p' | 'P') => 5,
        _ => return 0,
    };

    match chars.next() {
        None => {}
        Some('B') if chars.next().is_none() => {}
        _ => return 0,
    }

    count.saturating_mul(1024u64.saturating_pow(exponent))
}
