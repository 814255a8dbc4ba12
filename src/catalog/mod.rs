//! Read-through access to harvested product metadata
//!
//! Nothing is cached: every call walks the catalog directory again, so a
//! harvester run is visible to the next request without a restart.

use std::io::ErrorKind;
use std::path::Path;

use tracing::debug;

use crate::error::CatalogError;
use crate::models::ProductMeta;

pub const META_FILE: &str = "meta.json";

/// Lists every product directory under `catalog_dir`, sorted by id.
///
/// A missing catalog directory yields an empty list; a product directory
/// without `meta.json` yields [`ProductMeta::placeholder`].
pub async fn list_products(catalog_dir: &Path) -> Result<Vec<ProductMeta>, CatalogError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CatalogError::Io { path, source }
    };

    let mut entries = match tokio::fs::read_dir(catalog_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Catalog directory {} does not exist", catalog_dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(io_err(catalog_dir)(e)),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err(catalog_dir))? {
        let path = entry.path();
        let metadata = tokio::fs::metadata(&path).await.map_err(io_err(&path))?;
        if !metadata.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str() {
            ids.push(id.to_string());
        }
    }
    ids.sort();

    let mut products = Vec::with_capacity(ids.len());
    for id in ids {
        let meta_path = catalog_dir.join(&id).join(META_FILE);
        let meta = match tokio::fs::read_to_string(&meta_path).await {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|source| CatalogError::Parse {
                    path: meta_path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => ProductMeta::placeholder(&id),
            Err(e) => return Err(io_err(&meta_path)(e)),
        };
        products.push(meta);
    }

    Ok(products)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn missing_directory_is_an_empty_catalog() {
        let dir = TempDir::new().unwrap();

        let products = list_products(&dir.path().join("bogotto")).await.unwrap();

        assert!(products.is_empty());
    }

    #[tokio::test]
    async fn reads_metadata_and_substitutes_placeholders() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("covelo")).unwrap();
        std::fs::create_dir_all(dir.path().join("blaze-air")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), "not a product").unwrap();
        std::fs::write(
            dir.path().join("covelo").join(META_FILE),
            r#"{"id": "covelo", "title": "Covelo", "url": "https://bogotto.eu/p/covelo",
                "priceText": "€ 199,00", "images": ["/bogotto/covelo/01.jpg"]}"#,
        )
        .unwrap();

        let products = list_products(dir.path()).await.unwrap();

        assert_eq!(products.len(), 2);
        assert_eq!(products[0], ProductMeta::placeholder("blaze-air"));
        assert_eq!(products[1].title, "Covelo");
        assert_eq!(products[1].images, ["/bogotto/covelo/01.jpg"]);
    }

    #[tokio::test]
    async fn malformed_metadata_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("covelo")).unwrap();
        std::fs::write(dir.path().join("covelo").join(META_FILE), "{not json").unwrap();

        let err = list_products(dir.path()).await.unwrap_err();

        assert!(matches!(err, CatalogError::Parse { .. }));
    }
}
