use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, warn};

use super::descriptor::StreamDescriptor;
use crate::source::{CatalogObject, QueryExecutor};
use crate::{Error, Result};

/// A recoverable problem with one catalog object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryWarning {
    /// Stream id of the object the warning refers to
    pub stream: String,
    pub message: String,
}

impl fmt::Display for DiscoveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stream, self.message)
    }
}

/// Item produced by [`Discoverer::discover`].
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Stream(StreamDescriptor),
    Warning(DiscoveryWarning),
}

/// Walks the source catalog and builds stream descriptors on demand.
pub struct Discoverer<'a> {
    executor: &'a mut dyn QueryExecutor,
    include_schemas: Option<Vec<String>>,
}

impl<'a> Discoverer<'a> {
    pub fn new(executor: &'a mut dyn QueryExecutor) -> Self {
        Self {
            executor,
            include_schemas: None,
        }
    }

    /// Restricts discovery to the named schemas.
    pub fn with_include_schemas(mut self, schemas: Option<Vec<String>>) -> Self {
        self.include_schemas = schemas.filter(|s| !s.is_empty());
        self
    }

    /// Lazily yields one descriptor per object, ordered by schema then name.
    ///
    /// Per-object failures become [`DiscoveryEvent::Warning`]s and the object
    /// is skipped. Failing to read the catalog listing ends the stream with a
    /// fatal error.
    pub fn discover(self) -> BoxStream<'a, Result<DiscoveryEvent>> {
        let walk = Walk {
            executor: self.executor,
            include_schemas: self.include_schemas,
            objects: None,
            previous: None,
            pending: VecDeque::new(),
        };
        stream::try_unfold(walk, |mut walk| async move {
            Ok(walk.next_event().await?.map(|event| (event, walk)))
        })
        .boxed()
    }
}

struct Walk<'a> {
    executor: &'a mut dyn QueryExecutor,
    include_schemas: Option<Vec<String>>,
    objects: Option<BoxStream<'static, Result<CatalogObject>>>,
    previous: Option<CatalogObject>,
    pending: VecDeque<DiscoveryEvent>,
}

impl Walk<'_> {
    async fn next_event(&mut self) -> Result<Option<DiscoveryEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            if self.objects.is_none() {
                let listing = self
                    .executor
                    .list_objects()
                    .await
                    .map_err(|e| Error::Connection(format!("Cannot read source catalog: {}", e)))?;
                self.objects = Some(listing);
            }
            let Some(objects) = self.objects.as_mut() else {
                return Ok(None);
            };
            let object = match objects.next().await {
                Some(Ok(object)) => object,
                Some(Err(e)) => {
                    return Err(Error::Discovery(format!("Catalog listing failed: {}", e)))
                }
                None => return Ok(None),
            };

            self.check_order(&object)?;
            if !self.is_included(&object) {
                debug!("Skipping {} (schema not included)", object.qualified_name());
                continue;
            }
            self.visit(object).await;
        }
    }

    fn check_order(&mut self, object: &CatalogObject) -> Result<()> {
        if let Some(previous) = &self.previous {
            if (&previous.schema, &previous.name) >= (&object.schema, &object.name) {
                return Err(Error::Discovery(format!(
                    "Catalog listing is not ordered: {} listed after {}",
                    object.qualified_name(),
                    previous.qualified_name()
                )));
            }
        }
        self.previous = Some(object.clone());
        Ok(())
    }

    fn is_included(&self, object: &CatalogObject) -> bool {
        match &self.include_schemas {
            Some(schemas) => schemas.iter().any(|s| s == &object.schema),
            None => true,
        }
    }

    async fn visit(&mut self, object: CatalogObject) {
        let stream = object.stream_id();
        let columns = match self.executor.describe(&object).await {
            Ok(columns) => columns,
            Err(e) => {
                self.skip(stream, format!("cannot describe object: {}", e));
                return;
            }
        };
        let descriptor = match StreamDescriptor::build(object, columns) {
            Ok(descriptor) => descriptor,
            Err(reason) => {
                self.skip(stream, reason);
                return;
            }
        };

        for column in &descriptor.columns {
            if let Some(message) = &column.warning {
                warn!(stream = %stream, column = %column.name, "{}", message);
                self.pending.push_back(DiscoveryEvent::Warning(DiscoveryWarning {
                    stream: stream.clone(),
                    message: format!("column '{}': {}", column.name, message),
                }));
            }
        }
        debug!(
            "Discovered {} with {} columns",
            descriptor.name,
            descriptor.columns.len()
        );
        self.pending.push_back(DiscoveryEvent::Stream(descriptor));
    }

    fn skip(&mut self, stream: String, message: String) {
        warn!(stream = %stream, "Skipping object: {}", message);
        self.pending
            .push_back(DiscoveryEvent::Warning(DiscoveryWarning { stream, message }));
    }
}
