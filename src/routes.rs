//! Route directory: route id → voice channel + ordered stop list.
//!
//! Built once at startup from the validated configuration and never
//! mutated afterwards.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::config::{ChannelRef, RouteConfig};
use crate::discord::rest::GuildChannel;
use crate::error::AnnounceError;
use crate::station::canonical_name;

/// A transit line with its announcement channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub id: String,
    pub channel_id: u64,
    pub stops: Vec<String>,
}

impl Route {
    /// Whether `station` names the final stop (case/format-insensitive).
    pub fn is_last_stop(&self, station: &str) -> bool {
        self.stops
            .last()
            .is_some_and(|last| canonical_name(last) == canonical_name(station))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route {0:?} has no stops")]
    NoStops(String),

    #[error("route {0:?} is defined more than once")]
    Duplicate(String),

    #[error("route {route:?} references unknown voice channel {channel:?}")]
    UnknownChannel { route: String, channel: String },

    #[error("route {0:?} has no voice channel and no default channel is configured")]
    NoChannel(String),
}

/// Read-only lookup table of configured routes.
#[derive(Debug, Default)]
pub struct RouteDirectory {
    routes: HashMap<String, Route>,
}

impl RouteDirectory {
    /// Build a directory from already-resolved routes.
    pub fn new(routes: Vec<Route>) -> Result<Self, RouteError> {
        let mut map = HashMap::with_capacity(routes.len());
        for route in routes {
            if route.stops.is_empty() {
                return Err(RouteError::NoStops(route.id));
            }
            let key = canonical_name(&route.id);
            if map.contains_key(&key) {
                return Err(RouteError::Duplicate(route.id));
            }
            map.insert(key, route);
        }
        Ok(Self { routes: map })
    }

    /// Resolve configured routes against the guild's voice channels.
    ///
    /// Channel names must match a voice channel exactly; routes without a
    /// channel reference fall back to `default_channel`.
    pub fn resolve(
        configs: &[RouteConfig],
        default_channel: Option<u64>,
        channels: &[GuildChannel],
    ) -> Result<Self, RouteError> {
        let mut routes = Vec::with_capacity(configs.len());

        for cfg in configs {
            let channel_id = match cfg.channel_ref() {
                Some(ChannelRef::Id(id)) => id,
                Some(ChannelRef::Name(name)) => channels
                    .iter()
                    .find(|c| c.is_voice() && c.name == name)
                    .map(|c| c.id)
                    .ok_or_else(|| RouteError::UnknownChannel {
                        route: cfg.id.clone(),
                        channel: name.to_string(),
                    })?,
                None => default_channel.ok_or_else(|| RouteError::NoChannel(cfg.id.clone()))?,
            };

            routes.push(Route {
                id: cfg.id.clone(),
                channel_id,
                stops: cfg.stops.clone(),
            });
        }

        Self::new(routes)
    }

    /// Look up a route by id, or [`AnnounceError::UnknownRoute`].
    pub fn get(&self, route_id: &str) -> Result<&Route, AnnounceError> {
        self.routes
            .get(&canonical_name(route_id))
            .ok_or_else(|| AnnounceError::UnknownRoute(route_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }
}
