//! Named-instance registry with configuration inheritance
//!
//! A [`Registry`] lazily creates one instance per name and keeps it until it
//! is explicitly removed. Configuration for a new instance is resolved in
//! this order:
//!
//! 1. a config passed for that instance ([`ConfigSource::Instance`])
//! 2. a named shared config ([`ConfigSource::Named`]), which may itself be
//!    derived from another shared config
//! 3. the `"default"` config
//!
//! The registry is an explicit value owned by whoever builds it; there is no
//! process-wide singleton.
//!
//! # Example
//!
//! ```
//! use bulwark_core_resilience::bulkhead::{Bulkhead, BulkheadConfig};
//!
//! let registry = Bulkhead::registry(BulkheadConfig::default());
//! let a = registry.get_or_create("inventory").unwrap();
//! let b = registry.get_or_create("inventory").unwrap();
//! assert!(std::sync::Arc::ptr_eq(&a, &b));
//! ```

use crate::error::ResilienceError;
use crate::event::{EventKind, EventPublisher};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Name under which the fallback configuration is stored
pub const DEFAULT_CONFIG_NAME: &str = "default";

/// String tags attached to registries and their entries
pub type Tags = HashMap<String, String>;

type Customizer<C> = Arc<dyn Fn(C) -> C + Send + Sync>;
type Factory<T, C> = Arc<dyn Fn(&str, C, &Tags) -> Result<T, ResilienceError> + Send + Sync>;

/// A stored shared configuration
#[derive(Clone)]
pub enum ConfigTemplate<C> {
    /// Complete configuration
    Config(C),
    /// Configuration built by customizing another shared configuration
    Derived { base: String, customize: Customizer<C> },
}

/// Where a new instance takes its configuration from
#[derive(Debug, Clone)]
pub enum ConfigSource<C> {
    Default,
    Named(String),
    Instance(C),
}

/// Registry lifecycle notifications
#[derive(Debug)]
pub enum RegistryEvent<T> {
    EntryAdded { entry: Arc<T> },
    EntryRemoved { entry: Arc<T> },
    EntryReplaced { old: Arc<T>, new: Arc<T> },
}

// Manual impl: instances themselves are not Clone, only their handles.
impl<T> Clone for RegistryEvent<T> {
    fn clone(&self) -> Self {
        match self {
            RegistryEvent::EntryAdded { entry } => RegistryEvent::EntryAdded {
                entry: Arc::clone(entry),
            },
            RegistryEvent::EntryRemoved { entry } => RegistryEvent::EntryRemoved {
                entry: Arc::clone(entry),
            },
            RegistryEvent::EntryReplaced { old, new } => RegistryEvent::EntryReplaced {
                old: Arc::clone(old),
                new: Arc::clone(new),
            },
        }
    }
}

impl<T> EventKind for RegistryEvent<T> {
    fn kind(&self) -> &'static str {
        match self {
            RegistryEvent::EntryAdded { .. } => "ADDED",
            RegistryEvent::EntryRemoved { .. } => "REMOVED",
            RegistryEvent::EntryReplaced { .. } => "REPLACED",
        }
    }
}

/// Thread-safe name → instance cache
pub struct Registry<T, C> {
    entries: DashMap<String, Arc<T>>,
    default_config: C,
    configurations: RwLock<HashMap<String, ConfigTemplate<C>>>,
    tags: Tags,
    factory: Factory<T, C>,
    events: EventPublisher<RegistryEvent<T>>,
}

impl<T, C> Registry<T, C>
where
    T: fmt::Debug + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    /// Create a registry. `factory` builds an instance from its name,
    /// resolved config and merged tags.
    pub fn new(
        default_config: C,
        factory: impl Fn(&str, C, &Tags) -> Result<T, ResilienceError> + Send + Sync + 'static,
    ) -> Self {
        let mut configurations = HashMap::new();
        configurations.insert(
            DEFAULT_CONFIG_NAME.to_string(),
            ConfigTemplate::Config(default_config.clone()),
        );
        Self {
            entries: DashMap::new(),
            default_config,
            configurations: RwLock::new(configurations),
            tags: Tags::new(),
            factory: Arc::new(factory),
            events: EventPublisher::default(),
        }
    }

    /// Tags merged into every entry created by this registry
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Registry-level tags
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Register a complete shared configuration
    pub fn add_configuration(&self, name: &str, config: C) -> Result<(), ResilienceError> {
        self.insert_template(name, ConfigTemplate::Config(config))
    }

    /// Register a shared configuration derived from `base`
    pub fn add_derived_configuration(
        &self,
        name: &str,
        base: &str,
        customize: impl Fn(C) -> C + Send + Sync + 'static,
    ) -> Result<(), ResilienceError> {
        self.insert_template(
            name,
            ConfigTemplate::Derived {
                base: base.to_string(),
                customize: Arc::new(customize),
            },
        )
    }

    fn insert_template(&self, name: &str, template: ConfigTemplate<C>) -> Result<(), ResilienceError> {
        if name == DEFAULT_CONFIG_NAME {
            return Err(ResilienceError::InvalidConfig(format!(
                "'{}' is reserved for the default configuration",
                DEFAULT_CONFIG_NAME
            )));
        }
        let mut configs = self.configurations.write();
        let previous = configs.insert(name.to_string(), template);
        // Reject references that do not resolve, leaving the map untouched.
        if let Err(err) = resolve(&configs, name) {
            match previous {
                Some(prev) => configs.insert(name.to_string(), prev),
                None => configs.remove(name),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Resolve a shared configuration by name
    pub fn configuration(&self, name: &str) -> Result<C, ResilienceError> {
        resolve(&self.configurations.read(), name)
    }

    /// The `"default"` configuration
    pub fn default_config(&self) -> C {
        self.default_config.clone()
    }

    /// Get the named instance, creating it from the default config if absent
    pub fn get_or_create(&self, name: &str) -> Result<Arc<T>, ResilienceError> {
        self.get_or_create_with(name, ConfigSource::Default, Tags::new())
    }

    /// Get the named instance, creating it from `config` if absent
    pub fn get_or_create_with_config(&self, name: &str, config: C) -> Result<Arc<T>, ResilienceError> {
        self.get_or_create_with(name, ConfigSource::Instance(config), Tags::new())
    }

    /// Get the named instance, creating it from a shared config if absent
    pub fn get_or_create_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<Arc<T>, ResilienceError> {
        self.get_or_create_with(name, ConfigSource::Named(config_name.to_string()), Tags::new())
    }

    /// Get the named instance, creating it if absent.
    ///
    /// Under concurrent first access exactly one caller constructs the
    /// instance and exactly one `EntryAdded` event is published; everyone
    /// else receives the winner's instance.
    pub fn get_or_create_with(
        &self,
        name: &str,
        source: ConfigSource<C>,
        tags: Tags,
    ) -> Result<Arc<T>, ResilienceError> {
        if let Some(existing) = self.entries.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let mut created = false;
        let instance = match self.entries.entry(name.to_string()) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let config = match source {
                    ConfigSource::Default => self.default_config(),
                    ConfigSource::Named(config_name) => self.configuration(&config_name)?,
                    ConfigSource::Instance(config) => config,
                };
                let mut merged = self.tags.clone();
                merged.extend(tags);
                let instance = Arc::new((self.factory)(name, config, &merged)?);
                vacant.insert(Arc::clone(&instance));
                created = true;
                instance
            }
        };

        if created {
            debug!(name, "registry entry added");
            self.events.publish(
                name,
                RegistryEvent::EntryAdded {
                    entry: Arc::clone(&instance),
                },
            );
        }
        Ok(instance)
    }

    /// Look up an instance without creating it
    pub fn find(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Every registered instance, in no particular order
    pub fn all(&self) -> Vec<Arc<T>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Names of every registered instance
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove an instance; publishes `EntryRemoved` if one was present
    pub fn remove(&self, name: &str) -> Option<Arc<T>> {
        let (_, removed) = self.entries.remove(name)?;
        debug!(name, "registry entry removed");
        self.events.publish(
            name,
            RegistryEvent::EntryRemoved {
                entry: Arc::clone(&removed),
            },
        );
        Some(removed)
    }

    /// Swap an existing instance for a new one; publishes `EntryReplaced`.
    /// Returns `None` (and stores nothing) if the name is not registered.
    pub fn replace(&self, name: &str, instance: T) -> Option<Arc<T>> {
        let new = Arc::new(instance);
        let old = self
            .entries
            .get_mut(name)
            .map(|mut slot| std::mem::replace(slot.value_mut(), Arc::clone(&new)))?;
        debug!(name, "registry entry replaced");
        self.events.publish(
            name,
            RegistryEvent::EntryReplaced {
                old: Arc::clone(&old),
                new,
            },
        );
        Some(old)
    }

    /// Registry lifecycle events
    pub fn event_publisher(&self) -> &EventPublisher<RegistryEvent<T>> {
        &self.events
    }

    /// Build an instance with this registry's factory without registering it
    pub fn build(&self, name: &str, config: C) -> Result<T, ResilienceError> {
        (self.factory)(name, config, &self.tags)
    }
}

fn resolve<C: Clone>(
    configs: &HashMap<String, ConfigTemplate<C>>,
    name: &str,
) -> Result<C, ResilienceError> {
    let mut chain: Vec<String> = Vec::new();
    let mut customizers: Vec<Customizer<C>> = Vec::new();
    let mut current = name.to_string();
    let base = loop {
        if chain.contains(&current) {
            chain.push(current);
            return Err(ResilienceError::ConfigurationCycle(chain));
        }
        chain.push(current.clone());
        match configs.get(&current) {
            None => return Err(ResilienceError::UnknownConfiguration(current)),
            Some(ConfigTemplate::Config(config)) => break config.clone(),
            Some(ConfigTemplate::Derived { base, customize }) => {
                customizers.push(Arc::clone(customize));
                current = base.clone();
            }
        }
    };
    Ok(customizers
        .into_iter()
        .rev()
        .fold(base, |config, customize| customize(config)))
}

impl<T, C> fmt::Debug for Registry<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.len())
            .field("configurations", &self.configurations.read().len())
            .field("tags", &self.tags)
            .finish()
    }
}
