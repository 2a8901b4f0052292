use {
    anyhow::{Context, Result},
    itertools::Itertools,
    std::{
        collections::BTreeSet,
        io::Write,
        path::Path,
    },
    tap::prelude::*,
    tempfile::TempPath,
};

/// directory roots that game archives are known to carry in either case; the
/// tool matches patterns case-sensitively, so both spellings are emitted
pub const DEFAULT_CASE_VARIANT_ROOTS: &[&str] = &["textures", "meshes", "sounds", "music", "scripts", "interface"];

fn title_case(word: &str) -> String {
    word.chars()
        .enumerate()
        .map(|(idx, c)| match idx {
            0 => c.to_ascii_uppercase(),
            _ => c.to_ascii_lowercase(),
        })
        .collect()
}

/// expands one requested path into every spelling the native tool might need:
/// slash direction, optional leading separator, and case variants of the
/// well-known roots
pub fn path_variants(requested: &str, case_variant_roots: &[&str]) -> BTreeSet<String> {
    let forward = requested.replace('\\', "/");
    let root_variants = forward
        .split_once('/')
        .map(|(root, rest)| {
            case_variant_roots
                .iter()
                .filter(|known| known.eq_ignore_ascii_case(root))
                .flat_map(|known| [known.to_lowercase(), title_case(known)])
                .map(|root| format!("{root}/{rest}"))
                .collect_vec()
        })
        .unwrap_or_default();
    std::iter::once(forward)
        .chain(root_variants)
        .flat_map(|variant| [variant.clone(), variant.replace('/', "\\")])
        .flat_map(|variant| [variant.clone(), format!("/{}", variant.trim_start_matches(['/', '\\']))])
        .collect()
}

/// writes a `@listfile` for the archive tool, one quoted pattern per line
pub fn write_pattern_file(temp_dir: &Path, requested: impl IntoIterator<Item = impl AsRef<str>>, case_variant_roots: &[&str]) -> Result<TempPath> {
    tempfile::Builder::new()
        .prefix("patterns-")
        .suffix(".txt")
        .tempfile_in(temp_dir)
        .context("creating pattern file")
        .and_then(|mut file| {
            requested
                .into_iter()
                .flat_map(|requested| path_variants(requested.as_ref(), case_variant_roots))
                .try_for_each(|pattern| writeln!(file, "\"{pattern}\""))
                .context("writing patterns")
                .and_then(|_| file.flush().context("flushing pattern file"))
                .map(|_| file.into_temp_path())
        })
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_case_variants_for_known_roots() {
        let variants = path_variants("Textures/a.dds", DEFAULT_CASE_VARIANT_ROOTS);
        assert!(variants.contains("textures/a.dds"));
        assert!(variants.contains("Textures/a.dds"));
        assert!(variants.contains(r"textures\a.dds"));
        assert!(variants.contains(r"/textures\a.dds"));
    }

    #[test]
    fn test_no_case_variants_for_unknown_roots() {
        let variants = path_variants("docs/readme.txt", DEFAULT_CASE_VARIANT_ROOTS);
        assert_eq!(
            variants,
            [
                "docs/readme.txt",
                r"docs\readme.txt",
                "/docs/readme.txt",
                r"/docs\readme.txt"
            ]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_leading_separator_variants() {
        let variants = path_variants(r"meshes\armor.nif", DEFAULT_CASE_VARIANT_ROOTS);
        assert!(variants.contains("/meshes/armor.nif"));
        assert!(variants.contains("Meshes/armor.nif"));
    }
}
