//! Fabric identifier codec.
//!
//! Identifiers are persisted in the fabric as object names, so the encoding
//! below is a compatibility surface: changing it orphans every object already
//! created under the old names.
//!
//! Each component is escaped byte by byte. ASCII alphanumerics pass through;
//! any other byte `b` becomes `--XY-` where `XY` is the lowercase hex of `b`.
//! Escaped components are joined with a single `-`. Escapes therefore always
//! open with a run of two separators and close with one, which a lone joining
//! separator can never produce.

#![forbid(unsafe_code)]

/// Separator between components and the lead/trail character of escapes.
pub const SEPARATOR: char = '-';

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Escape a single name component into the fabric naming charset.
pub fn escape_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    push_escaped(&mut out, component);
    out
}

fn push_escaped(out: &mut String, component: &str) {
    for b in component.bytes() {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            out.push(SEPARATOR);
            out.push(SEPARATOR);
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
            out.push(SEPARATOR);
        }
    }
}

/// Build a fabric identifier from ordered name components.
///
/// Equal sequences always produce equal identifiers. The empty sequence
/// produces the empty string.
pub fn build_identifier<I, S>(components: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, c) in components.into_iter().enumerate() {
        if i > 0 { out.push(SEPARATOR); }
        push_escaped(&mut out, c.as_ref());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_vectors() {
        let cases: &[(&[&str], &str, &str)] = &[
            (&[], "", "empty"),
            (&["a", "b", "c"], "a-b-c", "simple"),
            (&["0", "1", "9"], "0-1-9", "numbers"),
            (&["AA", "BB", "ZZ"], "AA-BB-ZZ", "caps"),
            (&["a -", "-", "_"], "a--20---2d----2d----5f-", "encode"),
        ];
        for (components, want, desc) in cases {
            assert_eq!(build_identifier(components.iter()), *want, "{}", desc);
        }
    }

    #[test]
    fn separator_inside_component_is_escaped() {
        assert_eq!(escape_component("a-b"), "a--2d-b");
        assert_ne!(build_identifier(["a-b"]), build_identifier(["a", "b"]));
    }

    #[test]
    fn multibyte_chars_escape_every_byte() {
        // U+00E9 is 0xC3 0xA9 in UTF-8
        assert_eq!(escape_component("\u{e9}"), "--c3---a9-");
    }

    #[test]
    fn empty_components_are_kept_positionally() {
        assert_eq!(build_identifier(["", "a"]), "-a");
        assert_eq!(build_identifier(["a", ""]), "a-");
        assert_ne!(build_identifier(["", "a"]), build_identifier(["a", ""]));
    }

    #[test]
    fn owned_and_borrowed_inputs_agree() {
        let owned = vec!["web".to_string(), "common".to_string(), "SecurityGroup".to_string()];
        assert_eq!(build_identifier(&owned), build_identifier(["web", "common", "SecurityGroup"]));
        assert_eq!(build_identifier(&owned), "web-common-SecurityGroup");
    }
}
