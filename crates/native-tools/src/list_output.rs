use {
    anyhow::{Context, Result},
    itertools::Itertools,
    std::{collections::BTreeMap, path::PathBuf, str::FromStr},
    tap::prelude::*,
};

/// one entry of the `-slt` ("technical listing") output
#[derive(Debug, Clone, PartialEq)]
pub struct ListOutputEntry {
    /// path with separators normalized to `/`
    pub path: PathBuf,
    /// path exactly as the tool printed it - extraction output lands under this name
    pub original_path: String,
    pub size: u64,
    pub modified: Option<chrono::NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListOutput {
    pub entries: Vec<ListOutputEntry>,
}

const ENTRY_SEPARATOR: &str = "----------";

fn parse_block(block: &str) -> Result<Option<ListOutputEntry>> {
    block
        .lines()
        .filter_map(|line| line.split_once(" = "))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>()
        .pipe(|fields| {
            let attributes = fields.get("Attributes").copied().unwrap_or_default();
            let folder = fields.get("Folder").copied().unwrap_or_default();
            if attributes.starts_with('D') || folder == "+" {
                return Ok(None);
            }
            let original_path = fields
                .get("Path")
                .copied()
                .context("entry has no [Path] field")?
                .to_string();
            let size = fields
                .get("Size")
                .copied()
                .unwrap_or("0")
                .pipe(|size| match size.is_empty() {
                    true => Ok(0),
                    false => size
                        .parse::<u64>()
                        .with_context(|| format!("bad [Size] field: [{size}]")),
                })?;
            let modified = fields
                .get("Modified")
                .and_then(|modified| chrono::NaiveDateTime::parse_from_str(modified, "%Y-%m-%d %H:%M:%S").ok());
            Ok(Some(ListOutputEntry {
                path: original_path.replace('\\', "/").pipe(PathBuf::from),
                original_path,
                size,
                modified,
            }))
        })
}

impl FromStr for ListOutput {
    type Err = anyhow::Error;

    fn from_str(output: &str) -> Result<Self> {
        output
            .split_once(ENTRY_SEPARATOR)
            .map(|(_preamble, listing)| listing)
            .context("no entry separator in listing output")
            .and_then(|listing| {
                listing
                    .split("\n\n")
                    .map(str::trim)
                    .filter(|block| !block.is_empty())
                    .map(|block| parse_block(block).with_context(|| format!("parsing entry block:\n{block}")))
                    .filter_map_ok(|entry| entry)
                    .collect::<Result<Vec<_>>>()
            })
            .map(|entries| Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    const EXAMPLE: &str = r#"
7-Zip 23.01 (x64) : Copyright (c) 1999-2023 Igor Pavlov

Listing archive: example.7z

--
Path = example.7z
Type = 7z

----------
Path = textures\armor\steel.dds
Size = 1024
Modified = 2023-04-01 10:20:30
Attributes = A

Path = meshes
Size = 0
Attributes = D

Path = readme.txt
Size = 12
Modified = 2023-04-01 10:20:31
Attributes = A
"#;

    #[test]
    fn test_parses_technical_listing() {
        let ListOutput { entries } = EXAMPLE.parse::<ListOutput>().unwrap();
        assert_eq!(
            entries
                .iter()
                .map(|e| (e.path.display().to_string(), e.size))
                .collect::<Vec<_>>(),
            vec![
                ("textures/armor/steel.dds".to_string(), 1024),
                ("readme.txt".to_string(), 12)
            ]
        );
        assert_eq!(entries[0].original_path, r"textures\armor\steel.dds");
    }

    #[test]
    fn test_directories_are_skipped() {
        let ListOutput { entries } = EXAMPLE.parse::<ListOutput>().unwrap();
        assert!(entries.iter().all(|e| e.path != PathBuf::from("meshes")));
    }
}
