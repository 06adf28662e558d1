//! Source schema introspection and the portable type system.

pub mod descriptor;
pub mod discovery;
pub mod selection;
pub mod type_mapper;
pub mod types;


pub use descriptor::{Column, StreamDescriptor};
pub use discovery::{Discoverer, DiscoveryEvent, DiscoveryWarning};
pub use selection::{Catalog, CatalogEntry, Selection, StreamSettings};
pub use type_mapper::{map, Coercer, TypeMapping};
pub use types::{Decimal, PortableType, Record, Value};
