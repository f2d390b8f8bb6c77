//! Syntactic checks for proxy hosts: IP literals and (internationalized) domain names

use std::net::{IpAddr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;

/// Labels joined by dots; inner labels start and end alphanumeric, the last
/// label may be numeric, single-character or hyphenated.
static DOMAIN_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9](?:[a-zA-Z0-9_-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z0-9_-]+$")
        .expect("domain grammar is a valid regex")
});

/// `true` when `s` is a host this crate can dial: an IP literal or a domain
pub fn is_host(s: &str) -> bool {
    is_ip(s) || is_domain(s)
}

/// Accepts dotted-quad IPv4 and colon-form IPv6.
///
/// A bracketed literal (`[::1]`) must be IPv6 once the brackets are stripped.
/// Scoped addresses (`fe80::1%eth0`) are not supported.
pub fn is_ip(s: &str) -> bool {
    if let Some(inner) = s.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        return inner.parse::<Ipv6Addr>().is_ok();
    }
    s.parse::<IpAddr>().is_ok()
}

/// Accepts ASCII domain names and IDNs that transcode to a valid ASCII name
pub fn is_domain(s: &str) -> bool {
    if DOMAIN_GRAMMAR.is_match(s) {
        return true;
    }

    if s.chars().any(is_control) {
        return false;
    }

    if s.split('.').any(has_mixed_direction) {
        return false;
    }

    match idna::domain_to_ascii(s) {
        Ok(ascii) => DOMAIN_GRAMMAR.is_match(&ascii),
        Err(_) => false,
    }
}

fn is_control(c: char) -> bool {
    let c = c as u32;
    c < 0x20 || (0x7F..=0x9F).contains(&c)
}

fn is_rtl(c: char) -> bool {
    matches!(c as u32, 0x0590..=0x08FF | 0xFB1D..=0xFDFF | 0xFE70..=0xFEFF)
}

fn is_basic_latin_letter(c: char) -> bool {
    (0x41..=0x7A).contains(&(c as u32))
}

/// A label carrying both right-to-left script and basic Latin letters
fn has_mixed_direction(label: &str) -> bool {
    label.chars().any(is_rtl) && label.chars().any(is_basic_latin_letter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_domains() {
        let valid = [
            "example.com",
            "sub.example.com",
            "a.b.c.example.com",
            "my-domain.com",
            "my_domain.com",
            "my-domain_name.com",
            "example.x",
            "example.123",
            "example.my-domain",
            "example.my_tld",
            "example.co.uk",
            "123.example.com",
            "123example.com",
            "xn--fsq.xn--fiqs8s",
            "abcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcdefghijk.com",
        ];
        for domain in valid {
            assert!(is_domain(domain), "{domain} should be accepted");
        }

        let invalid = [
            "",
            ".com",
            "example!.com",
            "exa@mple.com",
            "abcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcdefghijkl.com",
            "example",
            "example..com",
            ".example.com",
            "example.com.",
        ];
        for domain in invalid {
            assert!(!is_domain(domain), "{domain} should be rejected");
        }
    }

    #[test]
    fn internationalized_domains() {
        let valid = [
            "例子.中国",
            "子域名.例子.中国",
            "test.例子.com",
            "テスト.jp",
            "пример.рф",
            "тест.рф",
            "בדיקה.il",
            "테스트.kr",
            "δοκιμή.gr",
            "مثال.مصر",
            "اختبار123.مصر",
        ];
        for domain in valid {
            assert!(is_domain(domain), "{domain} should be accepted");
        }

        assert!(!is_domain("\u{0080}test.com"));
        assert!(!is_domain("exa\u{0007}mple.com"));
        assert!(!is_domain("اختبارtest.com"));
    }

    #[test]
    fn idn_verdict_survives_ascii_encoding() {
        for domain in ["例子.中国", "тест.рф", "テスト.jp", "example.com", "δοκιμή.gr"] {
            assert!(is_domain(domain));
            let ascii = idna::domain_to_ascii(domain).unwrap();
            assert!(is_domain(&ascii), "{ascii} should still be accepted");
        }
    }

    #[test]
    fn ip_literals() {
        assert!(is_ip("127.0.0.1"));
        assert!(is_ip("::1"));
        assert!(is_ip("2001:db8::8a2e:370:7334"));
        assert!(is_ip("[::1]"));
        assert!(is_ip("[2001:db8::1]"));

        assert!(!is_ip(""));
        assert!(!is_ip("[]"));
        assert!(!is_ip("[127.0.0.1]"));
        assert!(!is_ip("fe80::1%eth0"));
        assert!(!is_ip("[fe80::1%eth0]"));
        assert!(!is_ip("256.0.0.1"));
        assert!(!is_ip("example.com"));
    }

    #[test]
    fn bracketed_ipv6_agrees_with_bare_form() {
        for addr in ["::1", "2001:db8::1", "::ffff:10.0.0.1", "fe80::abcd"] {
            assert_eq!(is_ip(&format!("[{addr}]")), is_ip(addr));
        }
    }

    #[test]
    fn hosts() {
        assert!(is_host("10.0.0.1"));
        assert!(is_host("proxy.example.org"));
        assert!(!is_host("not a host"));
    }
}
