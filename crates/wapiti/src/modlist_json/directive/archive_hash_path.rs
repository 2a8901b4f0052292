use {
    super::MaybeWindowsPath,
    itertools::Itertools,
    nonempty::NonEmpty,
    serde::{Deserialize, Serialize},
    std::iter::{empty, once},
    tap::prelude::*,
};

/// serialized as a non-empty json array: the outer archive's fingerprint
/// followed by the path segments leading to the entry (one segment per level
/// of archive nesting)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveHashPath {
    pub source_hash: String,
    pub path: Vec<MaybeWindowsPath>,
}

impl std::fmt::Debug for ArchiveHashPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.pipe(|Self { source_hash, path }| write!(f, "[{source_hash}] {}", path.iter().map(|p| &p.0).join(" -> ")))
    }
}

impl Serialize for ArchiveHashPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.pipe(|Self { source_hash, path }| {
            empty()
                .chain(once(source_hash.clone()))
                .chain(path.iter().map(|p| p.0.clone()))
                .collect::<Vec<_>>()
                .serialize(serializer)
        })
    }
}

impl<'de> Deserialize<'de> for ArchiveHashPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        NonEmpty::<String>::deserialize(deserializer).map(|NonEmpty { head, tail }| ArchiveHashPath {
            source_hash: head,
            path: tail.into_iter().map(MaybeWindowsPath).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_round_trip() {
        let parsed = serde_json::from_str::<ArchiveHashPath>(r#"["kPSWBSuHRkM=", "inner.bsa", "textures\\a.dds"]"#).unwrap();
        assert_eq!(parsed.source_hash, "kPSWBSuHRkM=");
        assert_eq!(parsed.path.len(), 2);
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            r#"["kPSWBSuHRkM=","inner.bsa","textures\\a.dds"]"#
        );
    }

    #[test]
    fn test_empty_array_is_rejected() {
        assert!(serde_json::from_str::<ArchiveHashPath>("[]").is_err());
    }
}
