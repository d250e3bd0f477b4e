//! Reproducible layer construction.
//!
//! Builds a gzipped tar layer from a source directory, rooted at the
//! destination path inside the image. The archive is byte-reproducible:
//! entries are visited in lexicographic order, timestamps are zeroed,
//! ownership is normalized and no extended attributes are carried over.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use inlay_core::error::{BuildError, Result};
use sha2::{Digest, Sha256};
use tar::{EntryType, Header};

use crate::context::BuildContext;
use crate::spec::InjectLayer;

/// A built layer: compressed bytes on disk plus the digests the manifest and
/// config need.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Path to the gzipped tar blob, registered for cleanup.
    pub path: PathBuf,
    pub media_type: String,
    /// sha256 of the compressed blob.
    pub digest: String,
    /// sha256 of the uncompressed tar stream.
    pub diff_id: String,
    /// Size of the compressed blob in bytes.
    pub size: i64,
}

/// Build a layer from the inject settings.
///
/// The tar stream is written to a registered temp file first, then compressed
/// into a second temp file while both digests are computed in one pass.
pub fn build(ctx: &BuildContext, inject: &InjectLayer, media_type: &str) -> Result<Layer> {
    ctx.ensure_active()?;

    let (tar_file, tar_path) = ctx.create_temp_file("inlay-layer-", ".tar")?;
    write_tar(
        tar_file,
        &inject.source_path,
        &inject.destination_path,
        inject.destination_chown,
    )?;

    let (blob_file, blob_path) = ctx.create_temp_file("inlay-layer-", ".tar.gz")?;
    let (diff_id, digest, size) = compress(&tar_path, blob_file)?;

    tracing::debug!(
        blob = %blob_path.display(),
        digest = %digest,
        diff_id = %diff_id,
        size,
        "layer built"
    );

    Ok(Layer {
        path: blob_path,
        media_type: media_type.to_string(),
        digest,
        diff_id,
        size,
    })
}

/// Write the uncompressed tar stream for the source tree.
fn write_tar(out: File, source: &Path, destination: &str, chown: bool) -> Result<()> {
    let mut builder = tar::Builder::new(out);
    let root = archive_root(destination);

    if !root.is_empty() {
        let metadata = source.symlink_metadata()?;
        let mut header = directory_header(&metadata, chown)?;
        builder.append_data(&mut header, format!("{}/", root), std::io::empty())?;
    }

    let mut entries = Vec::new();
    collect_entries(source, PathBuf::new(), &mut entries)?;

    for relative in entries {
        let absolute = source.join(&relative);
        let metadata = absolute.symlink_metadata()?;
        let name = archive_name(&root, &relative);

        if metadata.file_type().is_symlink() {
            return Err(BuildError::UnsupportedEntry(format!(
                "symbolic link at {}",
                absolute.display()
            )));
        }

        if metadata.is_dir() {
            let mut header = directory_header(&metadata, chown)?;
            builder.append_data(&mut header, format!("{}/", name), std::io::empty())?;
            continue;
        }

        if !metadata.is_file() {
            return Err(BuildError::UnsupportedEntry(format!(
                "special file at {}",
                absolute.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if metadata.nlink() > 1 {
                return Err(BuildError::UnsupportedEntry(format!(
                    "hard link at {}",
                    absolute.display()
                )));
            }
        }

        let mut header = file_header(&metadata, chown)?;
        let file = File::open(&absolute)?;
        builder.append_data(&mut header, &name, file)?;
    }

    let mut out = builder.into_inner()?;
    out.flush()?;
    Ok(())
}

/// Collect relative entry paths under `dir`, depth-first with siblings in
/// lexicographic order. Parents always precede their children.
fn collect_entries(base: &Path, relative: PathBuf, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(base.join(&relative))?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.file_name())
        .collect();
    children.sort();

    for child in children {
        let child_relative = relative.join(&child);
        let is_dir = base
            .join(&child_relative)
            .symlink_metadata()?
            .is_dir();
        out.push(child_relative.clone());
        if is_dir {
            collect_entries(base, child_relative, out)?;
        }
    }
    Ok(())
}

/// The in-archive prefix for the destination path: leading and trailing
/// slashes stripped. Empty means entries sit at the archive root.
fn archive_root(destination: &str) -> String {
    destination.trim_matches('/').to_string()
}

fn archive_name(root: &str, relative: &Path) -> String {
    let mut name = String::new();
    if !root.is_empty() {
        name.push_str(root);
        name.push('/');
    }
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    name.push_str(&parts.join("/"));
    name
}

fn file_header(metadata: &std::fs::Metadata, chown: bool) -> Result<Header> {
    let mut header = base_header(metadata, chown)?;
    header.set_entry_type(EntryType::Regular);
    header.set_size(metadata.len());
    Ok(header)
}

fn directory_header(metadata: &std::fs::Metadata, chown: bool) -> Result<Header> {
    let mut header = base_header(metadata, chown)?;
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    Ok(header)
}

fn base_header(metadata: &std::fs::Metadata, chown: bool) -> Result<Header> {
    let mut header = Header::new_gnu();
    header.set_mtime(0);

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        header.set_mode(metadata.mode() & 0o7777);
        if !chown {
            header.set_uid(metadata.uid() as u64);
            header.set_gid(metadata.gid() as u64);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        header.set_mode(if chown { 0o755 } else { 0o644 });
    }

    if chown {
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("root")?;
        header.set_groupname("root")?;
    }

    Ok(header)
}

/// Gzip the tar stream into `out`, hashing the uncompressed bytes for the
/// diff id and the compressed bytes for the blob digest.
fn compress(tar_path: &Path, out: File) -> Result<(String, String, i64)> {
    let mut reader = BufReader::new(File::open(tar_path)?);
    let mut diff_hasher = Sha256::new();
    let mut writer = HashingWriter::new(out);
    let mut encoder = GzEncoder::new(&mut writer, Compression::default());

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        diff_hasher.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
    }
    encoder.finish()?;

    let diff_id = format!("sha256:{}", hex::encode(diff_hasher.finalize()));
    let (digest, size) = writer.finish()?;
    Ok((diff_id, digest, size))
}

/// Writer adapter that hashes and counts everything passing through it.
struct HashingWriter {
    inner: File,
    hasher: Sha256,
    written: u64,
}

impl HashingWriter {
    fn new(inner: File) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(mut self) -> Result<(String, i64)> {
        self.inner.flush()?;
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        Ok((digest, self.written as i64))
    }
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
