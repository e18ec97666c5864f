//! Request/response header fields and token scanning.
//!
//! Request-side fields hold [`Block`](crate::pool::Block) ranges into the
//! connection's memory pool; the strings they name die with the pool on
//! keep-alive reset. Response-side headers are plain owned strings inside the
//! shared response object.

use crate::pool::{Block, MemPool};

/// Where in the protocol a field came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Ordinary request header.
    Header,
    /// One cookie crumb split out of a `Cookie:` header.
    Cookie,
    /// Trailer received after a chunked upload.
    Footer,
    /// Header set on a response before queueing.
    ResponseHeader,
    /// Decoded query argument from the request target.
    GetArgument,
    /// Decoded body field (reserved for host post-processors).
    PostData,
}

/// One received field. Name and value are ranges into the request pool;
/// duplicates are permitted and insertion order is preserved.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Field {
    pub kind: FieldKind,
    pub name: Block,
    pub value: Block,
}

/// Well-known header names the state machine consults.
pub(crate) mod name {
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    pub const CONNECTION: &str = "Connection";
    pub const EXPECT: &str = "Expect";
    pub const COOKIE: &str = "Cookie";
    pub const DATE: &str = "Date";
}

/// Case-insensitive comparison of a pooled name against a literal.
pub(crate) fn name_is(pool: &MemPool, field: &Field, name: &str) -> bool {
    pool.bytes(field.name).eq_ignore_ascii_case(name.as_bytes())
}

/// First field of `kind` whose name matches, in insertion order.
pub(crate) fn lookup<'a>(
    pool: &MemPool,
    fields: &'a [Field],
    kind: FieldKind,
    name: &str,
) -> Option<&'a Field> {
    fields
        .iter()
        .find(|f| f.kind == kind && name_is(pool, f, name))
}

/// Whether any comma-separated token of `value` equals `token`
/// (ASCII-case-insensitive, surrounding whitespace ignored). This is how
/// `Connection: close` and `Expect: 100-continue` are recognized.
pub(crate) fn has_token(value: &[u8], token: &str) -> bool {
    value
        .split(|&b| b == b',')
        .any(|t| trim_ascii(t).eq_ignore_ascii_case(token.as_bytes()))
}

/// Scan every field of `kind` named `name` for `token`.
pub(crate) fn any_field_has_token(
    pool: &MemPool,
    fields: &[Field],
    kind: FieldKind,
    name: &str,
    token: &str,
) -> bool {
    fields
        .iter()
        .filter(|f| f.kind == kind && name_is(pool, f, name))
        .any(|f| has_token(pool.bytes(f.value), token))
}

pub(crate) fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-decode `block` in place (`%xx` sequences and `+` as space).
/// Decoding only ever shrinks, so the result is a prefix of the original
/// range. Invalid escapes are passed through untouched.
pub(crate) fn unescape_in_place(pool: &mut MemPool, block: Block) -> Block {
    let bytes = pool.bytes_mut(block);
    let mut write = 0;
    let mut read = 0;
    while read < bytes.len() {
        let b = bytes[read];
        if b == b'%' && read + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[read + 1]), hex_value(bytes[read + 2])) {
                bytes[write] = hi << 4 | lo;
                write += 1;
                read += 3;
                continue;
            }
        }
        bytes[write] = if b == b'+' { b' ' } else { b };
        write += 1;
        read += 1;
    }
    block.slice(0, write)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pooled(pool: &mut MemPool, s: &str) -> Block {
        let b = pool.alloc(s.len()).unwrap();
        pool.bytes_mut(b).copy_from_slice(s.as_bytes());
        b
    }

    #[test]
    fn token_scan_is_case_insensitive() {
        assert!(has_token(b"close", "close"));
        assert!(has_token(b"Keep-Alive", "keep-alive"));
        assert!(has_token(b"upgrade, close", "close"));
        assert!(has_token(b" close ,keep-alive", "keep-alive"));
        assert!(!has_token(b"closed", "close"));
        assert!(!has_token(b"", "close"));
    }

    #[test]
    fn lookup_honors_insertion_order_and_kind() {
        let mut pool = MemPool::new(256);
        let fields = vec![
            Field {
                kind: FieldKind::Header,
                name: pooled(&mut pool, "Host"),
                value: pooled(&mut pool, "a"),
            },
            Field {
                kind: FieldKind::Header,
                name: pooled(&mut pool, "HOST"),
                value: pooled(&mut pool, "b"),
            },
            Field {
                kind: FieldKind::Footer,
                name: pooled(&mut pool, "Host"),
                value: pooled(&mut pool, "c"),
            },
        ];
        let hit = lookup(&pool, &fields, FieldKind::Header, "host").unwrap();
        assert_eq!(pool.str_of(hit.value), "a");
        let foot = lookup(&pool, &fields, FieldKind::Footer, "host").unwrap();
        assert_eq!(pool.str_of(foot.value), "c");
    }

    #[test]
    fn unescape_decodes_and_shrinks() {
        let mut pool = MemPool::new(64);
        let b = pooled(&mut pool, "a%26b+c%2Fd");
        let out = unescape_in_place(&mut pool, b);
        assert_eq!(pool.bytes(out), b"a&b c/d");
    }

    #[test]
    fn unescape_passes_bad_escapes_through() {
        let mut pool = MemPool::new(64);
        let b = pooled(&mut pool, "x%zz%4");
        let out = unescape_in_place(&mut pool, b);
        assert_eq!(pool.bytes(out), b"x%zz%4");
    }

    #[test]
    fn trim_strips_both_ends() {
        assert_eq!(trim_ascii(b"  a b\t"), b"a b");
        assert_eq!(trim_ascii(b""), b"");
        assert_eq!(trim_ascii(b" \t "), b"");
    }
}
