//! Addresses as `"0x..."` strings, since JSON numbers lose precision above
//! 2^53 and raw decimals are unreadable next to a fault report.

use std::fmt;

use serde::{ser::SerializeSeq, Serializer};

struct Hex(usize);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub fn serialize<S: Serializer>(value: &usize, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&Hex(*value))
}

pub fn serialize_all<S: Serializer>(values: &[usize], serializer: S) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(values.len()))?;
    for value in values {
        seq.serialize_element(&Hex(*value).to_string())?;
    }
    seq.end()
}

#[cfg(test)]
mod tests {
    use serde::Serialize;

    #[derive(Serialize)]
    struct Addr {
        #[serde(with = "crate::serialize::serde_usize")]
        at: usize,
        #[serde(serialize_with = "crate::serialize::serde_usize::serialize_all")]
        stack: Vec<usize>,
    }

    #[test]
    fn addresses_are_hex_strings() {
        let addr = Addr {
            at: 0x7f00_1000,
            stack: vec![0x10, 0xabc],
        };
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, r#"{"at":"0x7f001000","stack":["0x10","0xabc"]}"#);
    }
}
