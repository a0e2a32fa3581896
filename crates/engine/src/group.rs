//! An opened backup group: everything an operation needs, acquired once.

use crate::error::{ErrorKind, Result};
use crate::hasher::Hasher;
use crate::lock::GroupLock;
use crate::settings;
use crate::tags::{ExternalTagTool, Id3Stripper, TagTool};
use coffer_archive::{ContainerTool, Layout, RetryPolicy};
use coffer_catalog::{Catalog, Collection};
use coffer_config::GroupConfig;
use exn::ResultExt;
use tracing::instrument;

/// A backup group opened for exclusive use by this process.
///
/// Opening creates the working directories, takes the group lock, connects
/// to the catalog, locates the external tools the configuration asks for,
/// and checks the persisted group settings. The lock is held until the group
/// is closed or dropped.
pub struct Group {
    name: String,
    config: GroupConfig,
    layout: Layout,
    catalog: Catalog,
    tool: Box<dyn ContainerTool>,
    tags: Option<Box<dyn TagTool>>,
    retry: RetryPolicy,
    _lock: GroupLock,
}

impl Group {
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub async fn open(name: &str, config: &GroupConfig) -> Result<Self> {
        let layout = Layout::new(&config.data_dir);
        layout.create().or_raise(|| ErrorKind::Workspace(config.data_dir.clone()))?;
        let lock = GroupLock::acquire(&layout.lock())?;
        tracing::debug!(lock = %lock.path().display(), "acquired group lock");
        let retry = config.retry_policy();
        let tool = config.container.open(retry).or_raise(|| ErrorKind::Archive)?;
        let tags: Option<Box<dyn TagTool>> = match (&config.tag_tool, config.separate_audio_metadata) {
            (_, false) => None,
            (Some(tag_tool), true) => Some(Box::new(ExternalTagTool::new(tag_tool, &layout.scratch(), retry)?)),
            (None, true) => Some(Box::new(Id3Stripper)),
        };
        let catalog = Catalog::connect(layout.catalog()).await.or_raise(|| ErrorKind::Catalog)?;
        let mut session = catalog.begin().await.or_raise(|| ErrorKind::Catalog)?;
        settings::reconcile(&mut session, config.container).await?;
        session.commit().await.or_raise(|| ErrorKind::Catalog)?;
        tracing::info!(group = name, container = %config.container, "opened backup group");
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            layout,
            catalog,
            tool,
            tags,
            retry,
            _lock: lock,
        })
    }

    /// Close the catalog and release the lock.
    pub async fn close(self) {
        self.catalog.close().await;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn tool(&self) -> &dyn ContainerTool {
        self.tool.as_ref()
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Every collection, oldest first.
    pub async fn collections(&self) -> Result<Vec<Collection>> {
        let mut session = self.catalog.begin().await.or_raise(|| ErrorKind::Catalog)?;
        let mut collections = session.list_collections().await.or_raise(|| ErrorKind::Catalog)?;
        session.rollback().await.or_raise(|| ErrorKind::Catalog)?;
        collections.sort_by_key(|c| c.id);
        Ok(collections)
    }

    /// The most recent collection, finished or not.
    pub async fn latest_collection(&self) -> Result<Option<Collection>> {
        let mut session = self.catalog.begin().await.or_raise(|| ErrorKind::Catalog)?;
        let latest = session.last_collection().await.or_raise(|| ErrorKind::Catalog)?;
        session.rollback().await.or_raise(|| ErrorKind::Catalog)?;
        Ok(latest)
    }

    /// The hasher this group's content is identified with.
    pub fn hasher(&self) -> Hasher<'_> {
        match &self.tags {
            Some(tags) => Hasher::separating(tags.as_ref()),
            None => Hasher::plain(),
        }
    }
}
