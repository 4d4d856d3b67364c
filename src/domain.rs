use std::str::FromStr;

use n0_error::{AnyError, Result, anyerr, ensure_any};

use crate::HYBRID_SUFFIX;

const KEYWORD_HYBRID: &str = "hybrid";
const KEYWORD_OVER: &str = "over";
const KEYWORD_WITH: &str = "with";

const OVER_TAG: &str = ".over.";
const WITH_TAG: &str = ".with.";

/// A parsed hybrid routing domain.
///
/// The domain advances as the request travels the route:
///
/// ```text
/// client sends:  GET http://192.168.22.22.over.a.b.c.hybrid/x
/// a receives:    GET http://192.168.22.22.over.-a.b.c.hybrid/x
/// b receives:    GET http://192.168.22.22.over.a.-b.c.hybrid/x
/// c receives:    GET http://192.168.22.22.over.a.b.-c.hybrid/x
/// c dials 192.168.22.22 and sends: GET http://192.168.22.22/x
/// ```
///
/// With `with` instead of `over`, the terminal hop keeps the synthetic
/// hostname: `GET http://192.168.22.22.with.a.b.c.hybrid/x`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Domain {
    /// False for plain hostnames; then only `dial_hostname` and `is_end` are set.
    pub is_hybrid: bool,

    /// `over` rewrites the terminal hop's request host to `dial_hostname`;
    /// `with` preserves the synthetic hostname end-to-end.
    pub is_over: bool,

    /// The host the terminal hop dials. Always non-empty.
    pub dial_hostname: String,

    /// Name of the next hop to forward to. Empty at the terminal hop.
    pub next: String,

    /// True at the origin, before any label carries the current-hop marker.
    pub is_begin: bool,

    /// True at the terminal hop. When false, `next` is non-empty.
    pub is_end: bool,

    /// The host to place in the onward request. Always non-empty.
    pub next_hostname: String,
}

/// Whether `name` is usable as a hop label: lowercase alphanumerics and
/// inner dashes, and not one of the reserved keywords.
pub fn is_hybrid_name(name: &str) -> bool {
    match name {
        KEYWORD_HYBRID | KEYWORD_OVER | KEYWORD_WITH => return false,
        _ => {}
    }
    let bytes = name.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return false;
    };
    let inner_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-';
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(first) {
        return false;
    }
    match rest.split_last() {
        None => true,
        Some((&last, mid)) => edge_ok(last) && mid.iter().all(|&b| inner_ok(b)),
    }
}

impl FromStr for Domain {
    type Err = AnyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Domain {
    /// Parses a hostname into its routing record.
    ///
    /// Plain hostnames yield a terminal non-hybrid record. Hybrid hostnames
    /// must contain a `.over.` or `.with.` keyword; the route portion between
    /// the keyword and the `.hybrid` suffix is a dot-separated list of hop
    /// labels where at most one label carries a leading `-` marking the
    /// current hop.
    pub fn parse(hostname: &str) -> Result<Self> {
        if !hostname.ends_with(HYBRID_SUFFIX) {
            return Ok(Self {
                is_hybrid: false,
                dial_hostname: hostname.to_string(),
                is_end: true,
                ..Default::default()
            });
        }

        // `with` is tried first so a dial host containing ".over." keeps working.
        let (tag, idx) = match hostname.rfind(WITH_TAG) {
            Some(idx) => (WITH_TAG, idx),
            None => match hostname.rfind(OVER_TAG) {
                Some(idx) => (OVER_TAG, idx),
                None => return Err(anyerr!("bad hybrid domain: {hostname}")),
            },
        };

        let mut d = Self {
            is_hybrid: true,
            is_over: tag == OVER_TAG,
            dial_hostname: hostname[..idx].to_string(),
            is_begin: true,
            ..Default::default()
        };
        ensure_any!(!d.dial_hostname.is_empty(), "bad hybrid domain: {hostname}");

        let route_start = idx + tag.len();
        let route_end = hostname.len() - HYBRID_SUFFIX.len();
        if route_start > route_end {
            // No route at all, e.g. `192.168.22.22.over.hybrid`: the keyword
            // and suffix overlap on the final dot.
            d.is_end = true;
            d.next_hostname = if d.is_over {
                d.dial_hostname.clone()
            } else {
                hostname.to_string()
            };
            return Ok(d);
        }

        let mut labels: Vec<String> = hostname[route_start..route_end]
            .split('.')
            .map(str::to_string)
            .collect();

        let mut current = None;
        for (i, label) in labels.iter().enumerate() {
            let name = label.strip_prefix('-').unwrap_or(label);
            ensure_any!(is_hybrid_name(name), "bad hybrid domain: {hostname}");
            if name.len() != label.len() {
                ensure_any!(current.is_none(), "bad hybrid domain: {hostname}");
                current = Some(i);
            }
        }

        match current {
            Some(i) => {
                d.is_begin = false;
                labels[i] = labels[i][1..].to_string();
                if i + 1 < labels.len() {
                    d.next = labels[i + 1].clone();
                    labels[i + 1] = format!("-{}", d.next);
                } else {
                    d.is_end = true;
                }
            }
            None => {
                // No marker yet: the request is at the origin and the first
                // label becomes the current hop.
                d.next = labels[0].clone();
                labels[0] = format!("-{}", d.next);
            }
        }

        d.next_hostname = if d.is_over && d.is_end {
            d.dial_hostname.clone()
        } else {
            format!(
                "{}{}{}{}",
                d.dial_hostname,
                tag,
                labels.join("."),
                HYBRID_SUFFIX
            )
        };
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_hostname_is_terminal() {
        let d = Domain::parse("example.com").unwrap();
        assert!(!d.is_hybrid);
        assert!(d.is_end);
        assert_eq!(d.dial_hostname, "example.com");
    }

    #[test]
    fn first_hop_over() {
        let d = Domain::parse("192.168.22.22.over.a.b.c.hybrid").unwrap();
        assert!(d.is_hybrid);
        assert!(d.is_over);
        assert!(d.is_begin);
        assert!(!d.is_end);
        assert_eq!(d.dial_hostname, "192.168.22.22");
        assert_eq!(d.next, "a");
        assert_eq!(d.next_hostname, "192.168.22.22.over.-a.b.c.hybrid");
    }

    #[test]
    fn terminal_over_dials_directly() {
        let d = Domain::parse("192.168.22.22.over.a.b.-c.hybrid").unwrap();
        assert!(d.is_end);
        assert!(!d.is_begin);
        assert_eq!(d.next, "");
        assert_eq!(d.next_hostname, "192.168.22.22");
    }

    #[test]
    fn terminal_with_preserves_hostname() {
        let d = Domain::parse("192.168.22.22.with.a.b.-c.hybrid").unwrap();
        assert!(d.is_end);
        assert_eq!(d.next_hostname, "192.168.22.22.with.a.b.c.hybrid");
    }

    #[test]
    fn middle_hop_advances_marker() {
        let d = Domain::parse("host.over.a.-b.c.hybrid").unwrap();
        assert!(!d.is_begin);
        assert!(!d.is_end);
        assert_eq!(d.next, "c");
        assert_eq!(d.next_hostname, "host.over.a.b.-c.hybrid");
    }

    #[test]
    fn empty_route_over() {
        let d = Domain::parse("192.168.22.22.over.hybrid").unwrap();
        assert!(d.is_end);
        assert!(d.is_begin);
        assert_eq!(d.next_hostname, "192.168.22.22");
    }

    #[test]
    fn empty_route_with() {
        let d = Domain::parse("192.168.22.22.with.hybrid").unwrap();
        assert!(d.is_end);
        assert_eq!(d.next_hostname, "192.168.22.22.with.hybrid");
    }

    #[test]
    fn route_converges_in_hop_count_steps() {
        // one origin parse plus one per hop, advancing the marker by
        // exactly one label each time
        let mut host = "10.0.0.1.over.a.b.c.d.hybrid".to_string();
        let mut parses = 0;
        loop {
            let d = Domain::parse(&host).unwrap();
            parses += 1;
            if d.is_end {
                break;
            }
            host = d.next_hostname;
        }
        assert_eq!(parses, 5);
    }

    #[test]
    fn rejects_missing_keyword() {
        assert!(Domain::parse("a.b.hybrid").is_err());
    }

    #[test]
    fn rejects_reserved_and_malformed_labels() {
        assert!(Domain::parse("h.over.hybrid.a.hybrid").is_err());
        assert!(Domain::parse("h.over.a..b.hybrid").is_err());
        assert!(Domain::parse("h.over.UPPER.hybrid").is_err());
        assert!(Domain::parse("h.over.a-.hybrid").is_err());
        assert!(Domain::parse("h.over.-a.-b.hybrid").is_err());
    }

    #[test]
    fn with_keyword_wins_over_over() {
        let d = Domain::parse("x.over.y.with.a.hybrid").unwrap();
        assert!(!d.is_over);
        assert_eq!(d.dial_hostname, "x.over.y");
    }

    #[test]
    fn hybrid_names() {
        assert!(is_hybrid_name("a"));
        assert!(is_hybrid_name("a-b0"));
        assert!(!is_hybrid_name(""));
        assert!(!is_hybrid_name("-a"));
        assert!(!is_hybrid_name("a-"));
        assert!(!is_hybrid_name("over"));
        assert!(!is_hybrid_name("with"));
        assert!(!is_hybrid_name("hybrid"));
    }
}
