use super::*;

/// format-level header settings of the container being assembled - the variant
/// tag decides whether the tes4-era or the fo4-era writer runs
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "$type")]
pub enum ContainerState {
    #[serde(rename = "BSAState, Compression.BSA")]
    Bsa(BsaState),
    #[serde(rename = "BA2State, Compression.BSA")]
    Ba2(Ba2State),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct BsaState {
    pub archive_flags: u32,
    pub file_flags: u32,
    pub magic: String,
    pub version: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct Ba2State {
    pub has_name_table: bool,
    pub header_magic: String,
    #[serde(rename = "Type")]
    pub entry_type: u32,
    pub version: u32,
}

/// per-entry metadata; the variant decides how the entry is packed and whether
/// its bytes survive packing losslessly
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "$type")]
pub enum FileState {
    #[serde(rename = "BSAFileState, Compression.BSA")]
    BsaFile(BsaFileState),
    #[serde(rename = "BA2FileEntryState, Compression.BSA")]
    Ba2File(Ba2FileEntryState),
    #[serde(rename = "BA2DX10EntryState, Compression.BSA")]
    Ba2Dx10Entry(Ba2Dx10EntryState),
}

impl FileState {
    pub fn path(&self) -> &MaybeWindowsPath {
        match self {
            FileState::BsaFile(state) => &state.path,
            FileState::Ba2File(state) => &state.path,
            FileState::Ba2Dx10Entry(state) => &state.path,
        }
    }
    pub fn index(&self) -> u64 {
        match self {
            FileState::BsaFile(state) => state.index,
            FileState::Ba2File(state) => state.index,
            FileState::Ba2Dx10Entry(state) => state.index,
        }
    }
    /// dx10 textures are re-chunked and re-compressed on the way in, so their
    /// packed bytes do not hash-match the staged source
    pub fn is_lossy(&self) -> bool {
        matches!(self, FileState::Ba2Dx10Entry(_))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct BsaFileState {
    pub flip_compression: bool,
    pub index: u64,
    pub path: MaybeWindowsPath,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct Ba2FileEntryState {
    #[serde(default)]
    pub align: u64,
    pub compressed: bool,
    pub extension: String,
    #[serde(default)]
    pub flags: u64,
    pub index: u64,
    pub path: MaybeWindowsPath,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct Ba2Dx10EntryState {
    pub chunk_hdr_len: u64,
    pub chunks: Vec<Ba2Dx10EntryChunk>,
    pub height: u32,
    pub width: u32,
    pub num_mips: u32,
    pub pixel_format: u32,
    pub is_cube_map: u8,
    pub tile_mode: u8,
    #[serde(rename = "Unk8")]
    pub unk_8: u8,
    pub index: u64,
    pub path: MaybeWindowsPath,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "PascalCase")]
pub struct Ba2Dx10EntryChunk {
    pub align: u64,
    pub compressed: bool,
    pub end_mip: u64,
    pub full_sz: u64,
    pub start_mip: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "PascalCase")]
pub struct CreateBSADirective {
    pub hash: String,
    pub size: u64,
    pub to: MaybeWindowsPath,
    /// staging directory id: inputs for this container were installed under
    /// `<temp-bsa-root>/<temp_id>` by earlier directives
    #[serde(rename = "TempID")]
    pub temp_id: String,
    pub state: ContainerState,
    pub file_states: Vec<FileState>,
}

#[cfg(test)]
mod example_tests {
    use {super::*, crate::test_example};

    test_example!(
        r#"{
            "Hash": "AAECAwQFBgc=",
            "Size": 8388608,
            "To": "mods\\Some Mod\\Some Mod.bsa",
            "TempID": "bsa_00001",
            "State": {
                "$type": "BSAState, Compression.BSA",
                "ArchiveFlags": 3,
                "FileFlags": 2,
                "Magic": "BSA\u0000",
                "Version": 105
            },
            "FileStates": [
                {
                    "$type": "BSAFileState, Compression.BSA",
                    "FlipCompression": false,
                    "Index": 0,
                    "Path": "textures\\a.dds"
                }
            ]
        }"#,
        test_create_bsa_directive,
        CreateBSADirective
    );

    test_example!(
        r#"{
            "$type": "BA2DX10EntryState, Compression.BSA",
            "ChunkHdrLen": 24,
            "Chunks": [
                { "Align": 4096, "Compressed": true, "EndMip": 5, "FullSz": 174904, "StartMip": 0 }
            ],
            "Height": 512,
            "Width": 512,
            "NumMips": 10,
            "PixelFormat": 99,
            "IsCubeMap": 0,
            "TileMode": 8,
            "Unk8": 1,
            "Index": 3,
            "Path": "textures\\dx10.dds"
        }"#,
        test_dx10_file_state,
        FileState
    );

    #[test]
    fn test_dx10_is_lossy() {
        let state = serde_json::from_str::<FileState>(
            r#"{
                "$type": "BSAFileState, Compression.BSA",
                "FlipCompression": false,
                "Index": 0,
                "Path": "meshes\\a.nif"
            }"#,
        )
        .unwrap();
        assert!(!state.is_lossy());
    }
}
