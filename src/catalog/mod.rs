//! Product catalog consulted when settling purchases.

pub mod models;
pub mod repository;

pub use models::{CountryPrice, Product, ResolvedPrice, ANY_COUNTRY};
pub use repository::{PgProductCatalog, ProductCatalog};
