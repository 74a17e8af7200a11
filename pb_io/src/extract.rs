use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path};

use pb_core::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

pub fn detect_compression(header: &[u8]) -> Compression {
    match header {
        [0x1F, 0x8B, ..] => Compression::Gzip,
        [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, ..] => Compression::Xz,
        [0x28, 0xB5, 0x2F, 0xFD, ..] => Compression::Zstd,
        _ => Compression::None,
    }
}

fn open_decoder(path: &Path) -> Result<Box<dyn Read>, Error> {
    let corrupt = |e: std::io::Error| Error::store(format!("failed to read {}: {e}", path.display()));

    let mut header = [0u8; 6];
    let read = File::open(path)
        .and_then(|mut f| f.read(&mut header))
        .map_err(corrupt)?;

    let reader = BufReader::new(File::open(path).map_err(corrupt)?);
    let decoder: Box<dyn Read> = match detect_compression(&header[..read]) {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
        Compression::Zstd => Box::new(zstd::stream::Decoder::new(reader).map_err(corrupt)?),
    };
    Ok(decoder)
}

/// Unpack a (possibly compressed) tarball into `dest`.
///
/// Entries that would land outside `dest` are rejected.
pub fn extract_tarball(archive: &Path, dest: &Path) -> Result<(), Error> {
    let mut tar = tar::Archive::new(open_decoder(archive)?);
    tar.set_preserve_permissions(true);

    let entries = tar
        .entries()
        .map_err(|e| Error::store(format!("failed to read archive entries: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::store(format!("failed to read archive entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::store(format!("invalid archive path: {e}")))?
            .into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::store(format!(
                "archive entry escapes destination: {}",
                path.display()
            )));
        }

        entry.unpack_in(dest).map_err(|e| {
            Error::store(format!("failed to unpack {}: {e}", path.display()))
        })?;
    }

    Ok(())
}
