//! The Archive Manager: packs content into size-bounded containers for one
//! collection, verifies each container as it is sealed, and publishes them.
//!
//! Archives are written to the staging directory and only moved into the
//! ready directory by [`ArchiveManager::finish`], so an aborted run never
//! leaves a half-written archive where a restore would look for it.

use crate::checksum::file_checksum;
use crate::container::{ContainerTool, Member, Selection};
use crate::error::{ErrorKind, Result};
use crate::layout::Layout;
use crate::naming::{MANIFEST, archive_name, member_name};
use crate::retry::RetryPolicy;
use coffer_catalog::{CollectionId, ContentId, Location};
use coffer_compress::Compression;
use exn::{OptionExt, ResultExt};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Packing limits for a single archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackOptions {
    /// Rotate before an item would push the archive past this many bytes.
    pub target_size: u64,
    /// Rotate once an archive holds more than this many items.
    pub max_items: u64,
    /// Append a `manifest.txt` member listing source paths.
    pub write_manifest: bool,
}

/// Where and how one item ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stored {
    pub location: Location,
    pub member: String,
    pub stored_length: u64,
    pub compression: Compression,
}

/// A sealed, verified archive that has been moved into the ready directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub location: Location,
    pub name: String,
    pub path: PathBuf,
    /// BLAKE3 of the whole archive file.
    pub checksum: String,
    /// Content members, manifest excluded.
    pub items: usize,
}

struct OpenArchive {
    location: Location,
    path: PathBuf,
    members: Vec<Member>,
    manifest: Vec<String>,
    size: u64,
}

impl OpenArchive {
    fn must_rotate(&self, incoming: u64, options: &PackOptions) -> Result<bool> {
        // An empty archive always takes the item, however large.
        if self.members.is_empty() {
            return Ok(false);
        }
        let projected = self.size.checked_add(incoming).ok_or_raise(|| ErrorKind::Overflow)?;
        Ok(projected > options.target_size || self.members.len() as u64 > options.max_items)
    }
}

pub struct ArchiveManager<'t> {
    tool: &'t dyn ContainerTool,
    layout: Layout,
    collection: CollectionId,
    options: PackOptions,
    retry: RetryPolicy,
    current: Option<OpenArchive>,
    next_number: u32,
    sealed: Vec<(Location, PathBuf, usize)>,
}

impl<'t> ArchiveManager<'t> {
    pub fn new(
        tool: &'t dyn ContainerTool,
        layout: &Layout,
        collection: CollectionId,
        options: PackOptions,
        retry: RetryPolicy,
    ) -> Result<Self> {
        for dir in [layout.staging(), layout.ready(), layout.scratch()] {
            fs::create_dir_all(&dir).or_raise(|| ErrorKind::Workspace(dir.clone()))?;
        }
        Ok(Self {
            tool,
            layout: layout.clone(),
            collection,
            options,
            retry,
            current: None,
            next_number: 1,
            sealed: Vec::new(),
        })
    }

    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    /// Pack the file at `source` as content `id`.
    ///
    /// With `compress` set, the file is first compressed into the scratch
    /// directory so its stored size is known before the rotation check.
    /// `label` is written to the manifest next to the member name.
    #[instrument(skip(self, id, source, label), fields(collection = self.collection, id = format_args!("{id:08x}")))]
    pub fn add(&mut self, id: ContentId, source: &Path, compress: bool, label: &str) -> Result<Stored> {
        let compression = if compress { self.tool.member_compression() } else { Compression::None };
        let member = member_name(id, compression);
        let scratch = self.layout.scratch().join(&member);
        let (input, size) = if compress {
            (scratch.as_path(), self.tool.compress(source, &scratch)?)
        } else {
            (source, fs::metadata(source).map_err(|e| ErrorKind::io(e, source))?.len())
        };

        let mut archive = match self.current.take() {
            Some(archive) if archive.must_rotate(size, &self.options)? => {
                self.seal(archive)?;
                self.open_next()?
            },
            Some(archive) => archive,
            None => self.open_next()?,
        };
        let added = self.tool.add(&archive.path, input, &member, size);
        if compress {
            let _ = fs::remove_file(&scratch);
        }
        added?;
        archive.size = archive.size.checked_add(size).ok_or_raise(|| ErrorKind::Overflow)?;
        archive.members.push(Member::new(member.clone(), size));
        archive.manifest.push(format!("{member}\t{label}"));
        let location = archive.location;
        self.current = Some(archive);
        tracing::trace!(member, size, archive = location.archive, "packed item");
        Ok(Stored { location, member, stored_length: size, compression })
    }

    fn open_next(&mut self) -> Result<OpenArchive> {
        let location = Location { collection: self.collection, archive: self.next_number };
        self.next_number = self.next_number.checked_add(1).ok_or_raise(|| ErrorKind::Overflow)?;
        let path = self.layout.staging().join(archive_name(location, self.tool.extension()));
        // Left behind by an aborted run of the same collection.
        if path.exists() {
            tracing::warn!(path = %path.display(), "discarding stale staged archive");
            self.retry.run("remove stale archive", || fs::remove_file(&path)).map_err(|e| ErrorKind::io(e, &path))?;
        }
        Ok(OpenArchive { location, path, members: Vec::new(), manifest: Vec::new(), size: 0 })
    }

    /// Append the manifest and verify the container against what was added.
    fn seal(&mut self, mut archive: OpenArchive) -> Result<()> {
        let items = archive.members.len();
        if self.options.write_manifest {
            let mut text = archive.manifest.join("\n");
            text.push('\n');
            let manifest = self.layout.scratch().join(MANIFEST);
            fs::write(&manifest, &text).map_err(|e| ErrorKind::io(e, &manifest))?;
            let size = text.len() as u64;
            let added = self.tool.add(&archive.path, &manifest, MANIFEST, size);
            let _ = fs::remove_file(&manifest);
            added?;
            archive.members.push(Member::new(MANIFEST, size));
        }
        self.tool.verify(&archive.path, &archive.members)?;
        tracing::info!(
            archive = archive.location.archive,
            items,
            bytes = archive.size,
            "sealed and verified archive",
        );
        self.sealed.push((archive.location, archive.path, items));
        Ok(())
    }

    /// Seal the open archive and move every sealed archive into the ready
    /// directory, replacing any stale file with the same name.
    #[instrument(skip(self), fields(collection = self.collection))]
    pub fn finish(mut self) -> Result<Vec<Published>> {
        if let Some(archive) = self.current.take() {
            self.seal(archive)?;
        }
        let mut published = Vec::with_capacity(self.sealed.len());
        for (location, staged, items) in std::mem::take(&mut self.sealed) {
            let name = archive_name(location, self.tool.extension());
            let path = self.layout.ready().join(&name);
            self.retry.run("publish archive", || fs::rename(&staged, &path)).map_err(|e| ErrorKind::io(e, &staged))?;
            let checksum = file_checksum(&path)?;
            tracing::debug!(name, checksum, "published archive");
            published.push(Published { location, name, path, checksum, items });
        }
        Ok(published)
    }
}

/// A rebuilt archive waiting in the scratch directory.
#[derive(Debug)]
pub struct Repacked {
    pub path: PathBuf,
    pub members: Vec<Member>,
}

impl Repacked {
    /// Atomically replace `target` with the rebuilt archive.
    pub fn install(self, target: &Path, retry: RetryPolicy) -> Result<()> {
        retry.run("replace archive", || fs::rename(&self.path, target)).map_err(|e| ErrorKind::io(e, target))?;
        Ok(())
    }
}

/// Rebuild `archive` with only the members named in `keep`.
///
/// Every member is extracted to scratch, the survivors are packed into a new
/// container (plus `manifest`, when given), and the new container is
/// verified. The original is left untouched; see [`Repacked::install`].
#[instrument(skip(tool, keep, manifest, layout), fields(archive = %archive.display(), keep = keep.len()))]
pub fn repack(
    tool: &dyn ContainerTool,
    layout: &Layout,
    archive: &Path,
    keep: &BTreeSet<String>,
    manifest: Option<&str>,
) -> Result<Repacked> {
    if keep.is_empty() {
        exn::bail!(ErrorKind::Verification(format!("nothing would survive in {}", archive.display())));
    }
    let name = archive.file_name().ok_or_raise(|| ErrorKind::NotFound(archive.to_path_buf()))?;
    let mut workdir = layout.scratch().join(name).into_os_string();
    workdir.push(".extract");
    let workdir = PathBuf::from(workdir);
    if workdir.exists() {
        fs::remove_dir_all(&workdir).map_err(|e| ErrorKind::io(e, &workdir))?;
    }
    fs::create_dir_all(&workdir).or_raise(|| ErrorKind::Workspace(workdir.clone()))?;
    let rebuilt = layout.scratch().join(name);
    if rebuilt.exists() {
        fs::remove_file(&rebuilt).map_err(|e| ErrorKind::io(e, &rebuilt))?;
    }

    let result = repack_into(tool, archive, keep, manifest, &workdir, &rebuilt);
    let _ = fs::remove_dir_all(&workdir);
    let members = result?;
    Ok(Repacked { path: rebuilt, members })
}

fn repack_into(
    tool: &dyn ContainerTool,
    archive: &Path,
    keep: &BTreeSet<String>,
    manifest: Option<&str>,
    workdir: &Path,
    rebuilt: &Path,
) -> Result<Vec<Member>> {
    tool.extract(archive, Selection::All, workdir)?;
    let mut members = Vec::with_capacity(keep.len() + 1);
    for member in keep {
        let input = workdir.join(member);
        let size = match fs::metadata(&input) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                exn::bail!(ErrorKind::MemberNotFound(member.clone()))
            },
            Err(e) => exn::bail!(ErrorKind::io(e, &input)),
        };
        tool.add(rebuilt, &input, member, size)?;
        members.push(Member::new(member.clone(), size));
    }
    if let Some(text) = manifest {
        let input = workdir.join(MANIFEST);
        fs::write(&input, text).map_err(|e| ErrorKind::io(e, &input))?;
        let size = text.len() as u64;
        tool.add(rebuilt, &input, MANIFEST, size)?;
        members.push(Member::new(MANIFEST, size));
    }
    tool.verify(rebuilt, &members)?;
    Ok(members)
}
