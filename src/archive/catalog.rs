//!
//! # 图库目录
//! Looks up which photos a selector covers and who may download them.
//!
//! The service only depends on the two traits; `JsonCatalog` backs them with a
//! JSON file so the binary runs without a database.
//!

use std::collections::HashMap;
use std::fs;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;

use crate::archive::error::ArchiveError;
use crate::archive::target::{ArchiveObject, DownloadSelector, DownloadTarget, ResolvedTarget};

pub trait TargetResolver: Send + Sync + 'static {
    /// `Ok(None)` when the gallery or folder does not exist
    fn resolve<'a>(
        &'a self,
        selector: &'a DownloadSelector,
    ) -> BoxFuture<'a, Result<Option<ResolvedTarget>, ArchiveError>>;
}

pub trait AuthorizationOracle: Send + Sync + 'static {
    fn is_authorized<'a>(
        &'a self,
        selector: &'a DownloadSelector,
        requester: Option<&'a str>,
        credential: Option<&'a str>,
    ) -> BoxFuture<'a, bool>;
}

#[derive(Deserialize, Debug, Clone)]
pub struct CatalogFolder {
    pub id: u64,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CatalogPhoto {
    pub id: u64,
    pub name: String,
    pub storage_key: String,
    pub size: u64,
    pub folder_id: Option<u64>,
    #[serde(default)]
    pub liked_by: Vec<String>,
    #[serde(default)]
    pub favorited_by: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CatalogGallery {
    pub id: u64,
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Galleries without a password are public
    pub password: Option<String>,
    #[serde(default)]
    pub folders: Vec<CatalogFolder>,
    #[serde(default)]
    pub photos: Vec<CatalogPhoto>,
}

#[derive(Deserialize, Debug, Default)]
struct CatalogFile {
    galleries: Vec<CatalogGallery>,
}

#[derive(Debug, Default)]
pub struct JsonCatalog {
    galleries: HashMap<u64, CatalogGallery>,
}

/// Keep archive and entry names free of path and header trouble
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.');

    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

impl JsonCatalog {
    pub fn new(galleries: Vec<CatalogGallery>) -> Self {
        Self {
            galleries: galleries.into_iter().map(|g| (g.id, g)).collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json).context("Parsing catalog failed")?;
        Ok(Self::new(file.galleries))
    }

    pub fn load_from_file(file_path: &str) -> Result<Self> {
        let data = fs::read_to_string(file_path)
            .with_context(|| format!("Reading catalog failed: {}", file_path))?;
        Self::from_json(&data)
    }

    pub fn gallery_count(&self) -> usize {
        self.galleries.len()
    }

    fn lookup(&self, selector: &DownloadSelector) -> Option<ResolvedTarget> {
        let gallery = self.galleries.get(&selector.gallery_id())?;
        let gallery_name = sanitize(&gallery.name);
        let folder_names: HashMap<u64, &str> =
            gallery.folders.iter().map(|f| (f.id, f.name.as_str())).collect();

        let entry = |photo: &CatalogPhoto, with_folder: bool| {
            let name = sanitize(&photo.name);
            let name = match photo.folder_id.and_then(|id| folder_names.get(&id)) {
                Some(folder) if with_folder => format!("{}/{}", sanitize(folder), name),
                _ => name,
            };

            ArchiveObject {
                id: photo.id,
                name,
                storage_key: photo.storage_key.clone(),
                size: photo.size,
            }
        };

        let (objects, archive_name): (Vec<ArchiveObject>, String) = match selector {
            DownloadSelector::Gallery { .. } => (
                gallery.photos.iter().map(|p| entry(p, true)).collect(),
                gallery_name,
            ),
            DownloadSelector::Folder { folder_id, .. } => {
                let folder = folder_names.get(folder_id)?;
                (
                    gallery
                        .photos
                        .iter()
                        .filter(|p| p.folder_id == Some(*folder_id))
                        .map(|p| entry(p, false))
                        .collect(),
                    format!("{}-{}", gallery_name, sanitize(folder)),
                )
            }
            DownloadSelector::Liked { client_id, .. } => (
                gallery
                    .photos
                    .iter()
                    .filter(|p| p.liked_by.iter().any(|c| c == client_id))
                    .map(|p| entry(p, true))
                    .collect(),
                format!("{}-liked", gallery_name),
            ),
            DownloadSelector::Favorited { client_id, .. } => (
                gallery
                    .photos
                    .iter()
                    .filter(|p| p.favorited_by.iter().any(|c| c == client_id))
                    .map(|p| entry(p, true))
                    .collect(),
                format!("{}-favorites", gallery_name),
            ),
        };

        Some(ResolvedTarget {
            target: DownloadTarget::new(objects),
            archive_name,
            expires_at: gallery.expires_at,
        })
    }

    fn check_access(&self, selector: &DownloadSelector, requester: Option<&str>, credential: Option<&str>) -> bool {
        let Some(gallery) = self.galleries.get(&selector.gallery_id()) else {
            // unknown galleries are reported as not found later
            return true;
        };

        let password_ok = match &gallery.password {
            None => true,
            Some(password) => credential == Some(password.as_str()),
        };

        // a client may only pull its own selections
        let owner_ok = match selector {
            DownloadSelector::Liked { client_id, .. } | DownloadSelector::Favorited { client_id, .. } => {
                requester == Some(client_id.as_str())
            }
            _ => true,
        };

        password_ok && owner_ok
    }
}

impl TargetResolver for JsonCatalog {
    fn resolve<'a>(
        &'a self,
        selector: &'a DownloadSelector,
    ) -> BoxFuture<'a, Result<Option<ResolvedTarget>, ArchiveError>> {
        async move { Ok(self.lookup(selector)) }.boxed()
    }
}

impl AuthorizationOracle for JsonCatalog {
    fn is_authorized<'a>(
        &'a self,
        selector: &'a DownloadSelector,
        requester: Option<&'a str>,
        credential: Option<&'a str>,
    ) -> BoxFuture<'a, bool> {
        async move { self.check_access(selector, requester, credential) }.boxed()
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_CATALOG: &str = r#"{
  "galleries": [
    {
      "id": 1,
      "name": "Smith / Jones Wedding",
      "expires_at": null,
      "password": "hunter2",
      "folders": [ { "id": 10, "name": "Ceremony" }, { "id": 11, "name": "Party" } ],
      "photos": [
        { "id": 3, "name": "IMG_003.jpg", "storage_key": "g1/3.jpg", "size": 30, "folder_id": 11, "liked_by": ["c1"] },
        { "id": 1, "name": "IMG_001.jpg", "storage_key": "g1/1.jpg", "size": 10, "folder_id": 10, "liked_by": ["c1", "c2"] },
        { "id": 2, "name": "IMG_002.jpg", "storage_key": "g1/2.jpg", "size": 20, "folder_id": 10, "favorited_by": ["c2"] }
      ]
    },
    {
      "id": 2,
      "name": "Old Shoot",
      "expires_at": "2020-01-01T00:00:00Z",
      "password": null,
      "photos": [
        { "id": 1, "name": "a.jpg", "storage_key": "g2/1.jpg", "size": 5, "folder_id": null }
      ]
    }
  ]
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> JsonCatalog {
        JsonCatalog::from_json(SAMPLE_CATALOG).unwrap()
    }

    fn names(resolved: &ResolvedTarget) -> Vec<&str> {
        resolved.target.objects().iter().map(|o| o.name.as_str()).collect()
    }

    #[tokio::test]
    async fn should_resolve_whole_gallery_with_folder_prefixes() {
        let resolved = catalog()
            .resolve(&DownloadSelector::Gallery { gallery_id: 1 })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.archive_name, "Smith _ Jones Wedding");
        assert_eq!(
            names(&resolved),
            vec!["Ceremony/IMG_001.jpg", "Ceremony/IMG_002.jpg", "Party/IMG_003.jpg"]
        );
    }

    #[tokio::test]
    async fn should_resolve_folder() {
        let resolved = catalog()
            .resolve(&DownloadSelector::Folder { gallery_id: 1, folder_id: 10 })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.archive_name, "Smith _ Jones Wedding-Ceremony");
        assert_eq!(names(&resolved), vec!["IMG_001.jpg", "IMG_002.jpg"]);
    }

    #[tokio::test]
    async fn should_resolve_liked_and_favorited() {
        let catalog = catalog();
        let liked = catalog
            .resolve(&DownloadSelector::Liked { gallery_id: 1, client_id: "c1".into() })
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<u64> = liked.target.objects().iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![1, 3]);

        let favorited = catalog
            .resolve(&DownloadSelector::Favorited { gallery_id: 1, client_id: "c2".into() })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(favorited.target.len(), 1);
        assert_eq!(favorited.archive_name, "Smith _ Jones Wedding-favorites");
    }

    #[tokio::test]
    async fn should_not_find_unknown_gallery_or_folder() {
        let catalog = catalog();
        assert!(catalog
            .resolve(&DownloadSelector::Gallery { gallery_id: 99 })
            .await
            .unwrap()
            .is_none());
        assert!(catalog
            .resolve(&DownloadSelector::Folder { gallery_id: 1, folder_id: 99 })
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn should_check_password_and_ownership() {
        let catalog = catalog();
        let gallery = DownloadSelector::Gallery { gallery_id: 1 };
        assert!(!catalog.is_authorized(&gallery, None, None).await);
        assert!(!catalog.is_authorized(&gallery, None, Some("wrong")).await);
        assert!(catalog.is_authorized(&gallery, None, Some("hunter2")).await);

        let liked = DownloadSelector::Liked { gallery_id: 1, client_id: "c1".into() };
        assert!(catalog.is_authorized(&liked, Some("c1"), Some("hunter2")).await);
        assert!(!catalog.is_authorized(&liked, Some("c2"), Some("hunter2")).await);

        let public = DownloadSelector::Gallery { gallery_id: 2 };
        assert!(catalog.is_authorized(&public, None, None).await);
    }

    #[test]
    fn should_sanitize_names() {
        assert_eq!(sanitize("a/b\\c"), "a_b_c");
        assert_eq!(sanitize("  ..  "), "download");
        assert_eq!(sanitize("Été 2024"), "Été 2024");
    }
}
