use {
    anyhow::{Context, Result},
    std::io::{Read, Seek, SeekFrom},
};

/// formats the extraction dispatcher can recognise by leading bytes.
///
/// `Tes3` and `Bsa` genuinely overlap in the wild (pre-Oblivion archives carry
/// a bare version word) - the caller disambiguates by file extension; every
/// other match is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum FileType {
    Tes3,
    Bsa,
    Ba2,
    Btar,
    Zip,
    /// installer-payload executable
    Exe,
    RarOld,
    RarNew,
    SevenZip,
}

const SIGNATURES: &[(&[u8], FileType)] = &[
    // longer signatures first so prefixes of each other resolve correctly
    (b"Rar!\x1a\x07\x01\x00", FileType::RarNew),
    (b"Rar!\x1a\x07\x00", FileType::RarOld),
    (b"7z\xbc\xaf\x27\x1c", FileType::SevenZip),
    (b"PK\x03\x04", FileType::Zip),
    (b"BTAR", FileType::Btar),
    (b"BTDX", FileType::Ba2),
    (b"BSA\x00", FileType::Bsa),
    (b"TES3", FileType::Tes3),
    (&[0x00, 0x01, 0x00, 0x00], FileType::Tes3),
    (b"MZ", FileType::Exe),
];

const MAX_SIGNATURE_LEN: usize = 8;

/// reads just enough leading bytes to classify the stream, restoring the
/// position it found the stream at
pub fn recognize(reader: &mut (impl Read + Seek)) -> Result<Option<FileType>> {
    let position = reader
        .stream_position()
        .context("querying stream position")?;
    let mut prefix = [0u8; MAX_SIGNATURE_LEN];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader
            .read(&mut prefix[filled..])
            .context("reading signature prefix")?
        {
            0 => break,
            read => filled += read,
        }
    }
    reader
        .seek(SeekFrom::Start(position))
        .context("restoring stream position")?;
    Ok(SIGNATURES
        .iter()
        .find(|(magic, _)| prefix[..filled].starts_with(magic))
        .map(|(_, file_type)| *file_type))
}

pub fn recognize_path(path: &std::path::Path) -> Result<Option<FileType>> {
    use crate::utils::PathReadWrite;
    path.open_file_read()
        .and_then(|(_, mut file)| recognize(&mut file))
        .with_context(|| format!("recognizing file type of [{}]", path.display()))
}

#[cfg(test)]
mod tests {
    use {super::*, std::io::Cursor};

    fn recognize_bytes(bytes: &[u8]) -> Option<FileType> {
        let mut cursor = Cursor::new(bytes.to_vec());
        recognize(&mut cursor).unwrap()
    }

    #[test]
    fn test_recognizes_all_signatures() {
        assert_eq!(recognize_bytes(b"PK\x03\x04rest-of-file"), Some(FileType::Zip));
        assert_eq!(recognize_bytes(b"7z\xbc\xaf\x27\x1c\x00\x04"), Some(FileType::SevenZip));
        assert_eq!(recognize_bytes(b"Rar!\x1a\x07\x00data"), Some(FileType::RarOld));
        assert_eq!(recognize_bytes(b"Rar!\x1a\x07\x01\x00data"), Some(FileType::RarNew));
        assert_eq!(recognize_bytes(b"BTAR\x00\x01\x00\x03"), Some(FileType::Btar));
        assert_eq!(recognize_bytes(b"BTDX\x01\x00\x00\x00"), Some(FileType::Ba2));
        assert_eq!(recognize_bytes(b"BSA\x00\x68\x00\x00\x00"), Some(FileType::Bsa));
        assert_eq!(recognize_bytes(b"TES3data"), Some(FileType::Tes3));
        assert_eq!(recognize_bytes(&[0x00, 0x01, 0x00, 0x00, 0xff]), Some(FileType::Tes3));
        assert_eq!(recognize_bytes(b"MZ\x90\x00"), Some(FileType::Exe));
        assert_eq!(recognize_bytes(b"garbage!"), None);
        assert_eq!(recognize_bytes(b""), None);
    }

    #[test]
    fn test_position_is_restored() {
        let mut cursor = Cursor::new(b"PK\x03\x04rest".to_vec());
        cursor.seek(SeekFrom::Start(0)).unwrap();
        recognize(&mut cursor).unwrap();
        assert_eq!(cursor.stream_position().unwrap(), 0);
    }

    #[test]
    fn test_short_stream_does_not_error() {
        assert_eq!(recognize_bytes(b"MZ"), Some(FileType::Exe));
        assert_eq!(recognize_bytes(b"P"), None);
    }
}
