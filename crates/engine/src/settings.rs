//! Group settings persisted in the catalog.
//!
//! Some configuration can't change once archives exist: the container
//! format decides how every published archive must be read back. These
//! settings are recorded the first time a group is opened and checked on
//! every later open.

use crate::error::{ErrorKind, Result};
use coffer_archive::ContainerFormat;
use coffer_catalog::Session;
use exn::ResultExt;

const LAYOUT_VERSION_KEY: &str = "layout_version";
const LAYOUT_VERSION: &str = "1";
const CONTAINER_KEY: &str = "container";

/// Record the settings if they are missing, otherwise check they match.
pub(crate) async fn reconcile(session: &mut Session, container: ContainerFormat) -> Result<()> {
    match session.get_setting(LAYOUT_VERSION_KEY).await.or_raise(|| ErrorKind::Catalog)? {
        None => {
            session.set_setting(LAYOUT_VERSION_KEY, LAYOUT_VERSION).await.or_raise(|| ErrorKind::Catalog)?;
        },
        Some(version) if version == LAYOUT_VERSION => {},
        Some(version) => exn::bail!(ErrorKind::Settings(format!("unsupported layout version {version:?}"))),
    }
    match session.get_setting(CONTAINER_KEY).await.or_raise(|| ErrorKind::Catalog)? {
        None => {
            tracing::info!(%container, "recording container format for new group");
            session.set_setting(CONTAINER_KEY, container.as_str()).await.or_raise(|| ErrorKind::Catalog)?;
        },
        Some(stored) => match stored.parse::<ContainerFormat>() {
            Ok(format) if format == container => {},
            Ok(format) => exn::bail!(ErrorKind::Settings(format!(
                "archives were written as {format}, but the group is configured for {container}"
            ))),
            Err(_) => exn::bail!(ErrorKind::Settings(format!("unreadable container format {stored:?}"))),
        },
    }
    Ok(())
}
