//! Recipient addresses: normalization and extraction from headers.

use lazy_static::lazy_static;
use mailparse::{MailAddr, MailHeader};
use regex::Regex;

lazy_static! {
    static ref ADDRESS: Regex = Regex::new(r"^[^@\s<>]+@[^@\s<>]+$").unwrap();
}

/// Normalize an inbox address so that it can be used as an index key.
pub fn normalize(address: &str) -> String {
    address
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase()
}

/// Whether `address` is usable as an inbox key.
pub fn is_usable(address: &str) -> bool {
    ADDRESS.is_match(address)
}

/// Extract every usable address from an address-list header such as `To` or `From`.
///
/// Group syntax is flattened. Entries that cannot be used as an inbox key are dropped, so an
/// empty result means the header carried no usable address.
pub fn from_header(header: &MailHeader<'_>) -> Vec<String> {
    let list = match mailparse::addrparse_header(header) {
        Ok(list) => list,
        Err(e) => {
            tracing::debug!(error = %e, "unparsable address header, falling back to raw split");
            return header
                .get_value()
                .split(',')
                .map(normalize)
                .filter(|a| is_usable(a))
                .collect();
        }
    };

    let mut out: Vec<String> = Vec::new();
    let singles = list.iter().flat_map(|addr| match addr {
        MailAddr::Single(info) => vec![info],
        MailAddr::Group(group) => group.addrs.iter().collect(),
    });
    for info in singles {
        let a = normalize(&info.addr);
        if is_usable(&a) && !out.contains(&a) {
            out.push(a);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_strips() {
        assert_eq!(normalize("  <Bob@Example.COM> "), "bob@example.com");
    }

    #[test]
    fn usable_addresses() {
        assert!(is_usable("a@b.c"));
        assert!(!is_usable("undisclosed-recipients:;"));
        assert!(!is_usable(""));
        assert!(!is_usable("a b@c.d"));
    }

    #[test]
    fn header_extraction() {
        let raw = b"To: \"Alice\" <Alice@X.com>, bob@y.org, friends: carol@z.net;\r\n\r\n";
        let (headers, _) = mailparse::parse_headers(raw).unwrap();
        assert_eq!(
            from_header(&headers[0]),
            vec!["alice@x.com", "bob@y.org", "carol@z.net"]
        );
    }

    #[test]
    fn header_without_usable_address() {
        let raw = b"To: undisclosed-recipients:;\r\n\r\n";
        let (headers, _) = mailparse::parse_headers(raw).unwrap();
        assert!(from_header(&headers[0]).is_empty());
    }
}
