//! Dotted-quad address validation
//!
//! Bridge addresses are typed in by hand, so the check is strict: exactly four
//! dot-separated decimal groups, each in `0..=255`, nothing else.

/// Returns true iff `candidate` is a dotted-quad IPv4 address.
///
/// Whitespace, signs, empty groups and anything other than ASCII digits in a
/// group are rejected. A group is at most three digits, so `"010.0.0.1"` passes
/// but `"0010.0.0.1"` does not.
pub fn is_valid_ip(candidate: &str) -> bool {
    let mut groups = 0;

    for group in candidate.split('.') {
        groups += 1;
        if groups > 4 || !is_valid_group(group) {
            return false;
        }
    }

    groups == 4
}

fn is_valid_group(group: &str) -> bool {
    if group.is_empty() || group.len() > 3 {
        return false;
    }
    if !group.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    group.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
}
