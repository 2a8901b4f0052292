use super::*;

pub mod archive_hash_path;

pub mod create_bsa_directive;

pub use archive_hash_path::ArchiveHashPath;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "PascalCase")]
pub struct FromArchiveDirective {
    /// expected fingerprint of the produced file
    pub hash: String,
    pub size: u64,
    /// destination, relative to the installation directory
    pub to: MaybeWindowsPath,
    /// where the bytes come from: outer archive fingerprint plus the path of
    /// the entry inside it (nested archives carry more than one path segment)
    pub archive_hash_path: ArchiveHashPath,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "PascalCase")]
pub struct InlineFileDirective {
    pub hash: String,
    pub size: u64,
    /// id of the blob embedded in the modlist bundle
    #[serde(rename = "SourceDataID")]
    pub source_data_id: uuid::Uuid,
    pub to: MaybeWindowsPath,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "PascalCase")]
pub struct PatchedFromArchiveDirective {
    pub hash: String,
    pub size: u64,
    pub to: MaybeWindowsPath,
    pub archive_hash_path: ArchiveHashPath,
    /// fingerprint of the file as extracted, before the delta is applied
    pub from_hash: String,
    #[serde(rename = "PatchID")]
    pub patch_id: uuid::Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "PascalCase")]
pub struct RemappedInlineFileDirective {
    pub hash: String,
    pub size: u64,
    #[serde(rename = "SourceDataID")]
    pub source_data_id: uuid::Uuid,
    pub to: MaybeWindowsPath,
}

/// one source feeding a merged patch - already installed by an earlier
/// directive, referenced here by its location under the install directory
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "PascalCase")]
pub struct MergedPatchSource {
    pub hash: String,
    pub relative_path: MaybeWindowsPath,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "PascalCase")]
pub struct MergedPatchDirective {
    pub hash: String,
    pub size: u64,
    pub to: MaybeWindowsPath,
    #[serde(rename = "PatchID")]
    pub patch_id: uuid::Uuid,
    /// concatenated in declared order before the delta is applied
    pub sources: Vec<MergedPatchSource>,
}

#[cfg(test)]
mod example_tests {
    use {super::*, crate::test_example};

    test_example!(
        r#"{
            "Hash": "wDxHUkGNAfc=",
            "Size": 1024,
            "To": "mods\\Some Mod\\textures\\a.dds",
            "ArchiveHashPath": ["kPSWBSuHRkM=", "textures\\a.dds"]
        }"#,
        test_from_archive_directive,
        FromArchiveDirective
    );

    test_example!(
        r#"{
            "Hash": "YWJjZGVmZ2g=",
            "Size": 77,
            "SourceDataID": "e4f1a9a3-3a2e-4b2a-9f3f-6c3a1f1a9a30",
            "To": "profiles\\Default\\modlist.txt"
        }"#,
        test_inline_file_directive,
        InlineFileDirective
    );

    test_example!(
        r#"{
            "Hash": "AAECAwQFBgc=",
            "Size": 2048,
            "To": "mods\\Some Mod\\meshes\\fixed.nif",
            "ArchiveHashPath": ["kPSWBSuHRkM=", "meshes\\broken.nif"],
            "FromHash": "BwYFBAMCAQA=",
            "PatchID": "1c2d3e4f-5a6b-7c8d-9e0f-112233445566"
        }"#,
        test_patched_from_archive_directive,
        PatchedFromArchiveDirective
    );

    test_example!(
        r#"{
            "Hash": "AAECAwQFBgc=",
            "Size": 4096,
            "To": "mods\\Merged\\merged.esp",
            "PatchID": "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9",
            "Sources": [
                { "Hash": "AQIDBAUGBwg=", "RelativePath": "mods\\A\\a.esp" },
                { "Hash": "CAcGBQQDAgE=", "RelativePath": "mods\\B\\b.esp" }
            ]
        }"#,
        test_merged_patch_directive,
        MergedPatchDirective
    );
}
