//! Imaging store interfaces
//!
//! The multicast distribution engine persists session state and reads image
//! metadata through the traits in this crate. The production implementation
//! is backed by the platform database, which lives outside this workspace.
//!
//! # Example
//!
//! ```no_run
//! use imaging_store::{ImageCatalog, ImageRecord, InMemoryStore};
//!
//! # async fn example() -> Result<(), imaging_store::StoreError> {
//! let store = InMemoryStore::new();
//! store.add_image(ImageRecord {
//!     id: "ubuntu-24.04".to_string(),
//!     filename: "ubuntu-24.04.img".to_string(),
//!     size: 0,
//! });
//!
//! let image = store.get_image("ubuntu-24.04").await?;
//! assert_eq!(image.filename, "ubuntu-24.04.img");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod memory;
pub mod models;
#[path = "trait.rs"]
pub mod store_trait;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use models::*;
pub use store_trait::{ImageCatalog, SessionStore};
