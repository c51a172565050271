use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A key/value token used for kernel and hypervisor command lines.
///
/// An empty `value` makes the param a bare flag (`quiet`, `-nographic`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl Param {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
        }
    }

    /// Both fields empty; dropped on serialization.
    pub fn is_void(&self) -> bool {
        self.key.is_empty() && self.value.is_empty()
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}={}", self.key, self.value)
        }
    }
}

/// Ordered list of [`Param`]s.
///
/// Insertion order is preserved and duplicates are kept: `console=hvc0
/// console=hvc1` is meaningful on a kernel command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSet {
    params: Vec<Param>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `param`, rejecting an empty key.
    pub fn add(&mut self, param: Param) -> Result<()> {
        if param.key.is_empty() {
            return Err(Error::InvalidArgument(
                "parameter key must not be empty".to_string(),
            ));
        }
        self.params.push(param);
        Ok(())
    }

    /// Appends every param of `other` in order.
    pub fn extend_from(&mut self, other: &ParamSet) -> &mut Self {
        self.params.extend(other.params.iter().cloned());
        self
    }

    /// Flattens the set into command-line tokens.
    ///
    /// With an empty `delimiter`, a param carrying both key and value becomes
    /// two successive tokens (`-m`, `2048M`). Otherwise it becomes one
    /// `key{delimiter}value` token. A param with only a key or only a value
    /// always yields that single field, and void params yield nothing.
    pub fn serialize(&self, delimiter: &str) -> Vec<String> {
        let mut tokens = Vec::with_capacity(self.params.len());

        for p in &self.params {
            if p.is_void() {
                continue;
            } else if p.key.is_empty() {
                tokens.push(p.value.clone());
            } else if p.value.is_empty() {
                tokens.push(p.key.clone());
            } else if delimiter.is_empty() {
                tokens.push(p.key.clone());
                tokens.push(p.value.clone());
            } else {
                tokens.push(format!("{}{}{}", p.key, delimiter, p.value));
            }
        }

        tokens
    }

    /// Parses `key=value` tokens, splitting on the first `=`.
    ///
    /// Empty tokens are skipped and a token without `=` becomes a flag. This
    /// never fails.
    pub fn deserialize<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let params = tokens
            .into_iter()
            .filter_map(|token| {
                let token = token.as_ref();
                if token.is_empty() {
                    return None;
                }
                Some(match token.split_once('=') {
                    Some((key, value)) => Param::new(key, value),
                    None => Param::flag(token),
                })
            })
            .collect();

        Self { params }
    }

    /// Renders the set as a space separated kernel command line.
    pub fn to_cmdline(&self) -> String {
        self.serialize("=").join(" ")
    }

    /// Value of the first param with `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.iter().any(|p| p.key == key)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Param> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl<'a> IntoIterator for &'a ParamSet {
    type Item = &'a Param;
    type IntoIter = std::slice::Iter<'a, Param>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(params: &[(&str, &str)]) -> ParamSet {
        ParamSet {
            params: params.iter().map(|(k, v)| Param::new(*k, *v)).collect(),
        }
    }

    mod param {
        use super::*;

        #[test]
        fn flag_has_empty_value() {
            let p = Param::flag("quiet");
            assert_eq!(p.key, "quiet");
            assert!(p.value.is_empty());
        }

        #[test]
        fn void_only_when_both_fields_empty() {
            assert!(Param::default().is_void());
            assert!(!Param::flag("ro").is_void());
            assert!(!Param::new("", "value").is_void());
        }

        #[test]
        fn display_key_value() {
            assert_eq!(Param::new("root", "/dev/vda1").to_string(), "root=/dev/vda1");
        }

        #[test]
        fn display_flag() {
            assert_eq!(Param::flag("quiet").to_string(), "quiet");
        }
    }

    mod add {
        use super::*;

        #[test]
        fn rejects_empty_key() {
            let mut set = ParamSet::new();
            let err = set.add(Param::new("", "value")).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
            assert!(set.is_empty());
        }

        #[test]
        fn preserves_insertion_order_and_duplicates() {
            let mut set = ParamSet::new();
            set.add(Param::new("console", "hvc0")).unwrap();
            set.add(Param::flag("quiet")).unwrap();
            set.add(Param::new("console", "hvc1")).unwrap();
            assert_eq!(set.to_cmdline(), "console=hvc0 quiet console=hvc1");
            assert_eq!(set.get("console"), Some("hvc0"));
        }
    }

    mod serialize {
        use super::*;

        #[test]
        fn skips_void_params() {
            let set = set_of(&[("", ""), ("a", "1"), ("", "")]);
            assert_eq!(set.serialize("="), vec!["a=1"]);
        }

        #[test]
        fn emits_value_alone_when_key_empty() {
            let set = set_of(&[("", "orphan")]);
            assert_eq!(set.serialize("="), vec!["orphan"]);
            assert_eq!(set.serialize(""), vec!["orphan"]);
        }

        #[test]
        fn emits_key_alone_when_value_empty() {
            let set = set_of(&[("-nographic", "")]);
            assert_eq!(set.serialize(""), vec!["-nographic"]);
            assert_eq!(set.serialize("="), vec!["-nographic"]);
        }

        #[test]
        fn empty_delimiter_splits_into_two_tokens() {
            let set = set_of(&[("-m", "2048M"), ("-smp", "2")]);
            assert_eq!(set.serialize(""), vec!["-m", "2048M", "-smp", "2"]);
        }

        #[test]
        fn delimiter_joins_into_one_token() {
            let set = set_of(&[("root", "/dev/vda1"), ("panic", "1")]);
            assert_eq!(set.serialize("="), vec!["root=/dev/vda1", "panic=1"]);
            assert_eq!(set.serialize(":"), vec!["root:/dev/vda1", "panic:1"]);
        }

        #[test]
        fn empty_set_yields_no_tokens() {
            assert!(ParamSet::new().serialize("=").is_empty());
        }
    }

    mod deserialize {
        use super::*;

        #[test]
        fn splits_on_first_equals() {
            let set = ParamSet::deserialize(["init=/bin/sh -c a=b"]);
            assert_eq!(set.get("init"), Some("/bin/sh -c a=b"));
        }

        #[test]
        fn token_without_equals_becomes_flag() {
            let set = ParamSet::deserialize(["quiet"]);
            assert_eq!(set.iter().next(), Some(&Param::flag("quiet")));
        }

        #[test]
        fn skips_empty_tokens() {
            let set = ParamSet::deserialize(["", "ro", ""]);
            assert_eq!(set.len(), 1);
        }

        #[test]
        fn leading_equals_gives_empty_key() {
            let set = ParamSet::deserialize(["=value"]);
            assert_eq!(set.iter().next(), Some(&Param::new("", "value")));
        }

        #[test]
        fn roundtrip_with_default_delimiter() {
            let original = set_of(&[("root", "/dev/vda1"), ("quiet", ""), ("panic", "1")]);
            let tokens = original.serialize("=");
            assert_eq!(ParamSet::deserialize(&tokens), original);
        }

        #[test]
        fn pairs_survive_empty_delimiter_roundtrip() {
            let original = set_of(&[("tsc", "reliable"), ("iommu", "off")]);
            let tokens = original.serialize("");
            let pairs: Vec<String> = tokens
                .chunks(2)
                .map(|kv| format!("{}={}", kv[0], kv[1]))
                .collect();
            assert_eq!(ParamSet::deserialize(&pairs), original);
        }
    }

    mod serialization {
        use super::*;

        #[test]
        fn serializes_as_list_of_records() {
            let set = set_of(&[("root", "/dev/vda1")]);
            let json = serde_json::to_string(&set).unwrap();
            assert_eq!(json, r#"[{"key":"root","value":"/dev/vda1"}]"#);
        }

        #[test]
        fn value_defaults_to_empty() {
            let set: ParamSet = serde_json::from_str(r#"[{"key":"quiet"}]"#).unwrap();
            assert_eq!(set.iter().next(), Some(&Param::flag("quiet")));
        }
    }
}
