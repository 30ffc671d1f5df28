//! Topic mapping for the XBee-MQTT bridge
//!
//! This module provides mapping between:
//!
//! - **TopicPattern**: topic templates such as `/raw/xbee/{address}/{port}`
//!   that synthesize topics for ports without a static route, and parse
//!   inbound topics back into `(address, port)`
//! - **RoutingTable**: static routes `(address, port) → topic` plus the
//!   matching inbound `<topic>/set → (address, port)` actions
//!
//! # Item Patterns
//!
//! A template may contain an `{item}` placeholder. The port prefix is then
//! expanded to a readable item name (`adc-` → `analog`, `dio-` → `digital`,
//! `pin-` → `config`) and the inverse mapping is applied when parsing.

use std::collections::HashMap;
use tracing::{debug, trace, warn};

use crate::config::{BridgeSettings, RouteTable};
use crate::error::{BridgeError, Result};
use crate::port::{port_suffix, with_kind, Address, PortKind};

// ============================================================================
// Topic Pattern
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Address,
    Port,
    Item,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Fields extracted from a topic by [`TopicPattern::parse`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicFields {
    /// Raw `{address}` capture
    pub address: Option<String>,
    /// Raw `{port}` capture
    pub port: Option<String>,
    /// Raw `{item}` capture
    pub item: Option<String>,
}

/// Topic template with `{address}`, `{port}` and optional `{item}` fields
#[derive(Debug, Clone)]
pub struct TopicPattern {
    template: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compile a template
    pub fn new(template: &str) -> Result<Self> {
        let normalized = normalize_topic(template);
        let mut segments = Vec::new();
        let mut rest = normalized.as_str();

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..].find('}').ok_or_else(|| {
                BridgeError::InvalidConfig(format!("unclosed placeholder in {:?}", template))
            })? + open;
            let field = match &rest[open + 1..close] {
                "address" => Field::Address,
                "port" => Field::Port,
                "item" => Field::Item,
                other => {
                    return Err(BridgeError::InvalidConfig(format!(
                        "unknown placeholder {{{}}} in {:?}",
                        other, template
                    )))
                }
            };
            if matches!(segments.last(), Some(Segment::Field(_))) {
                return Err(BridgeError::InvalidConfig(format!(
                    "adjacent placeholders in {:?}",
                    template
                )));
            }
            segments.push(Segment::Field(field));
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            template: template.to_string(),
            segments,
        })
    }

    /// Template as configured
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Whether the template uses `{item}`
    pub fn has_item(&self) -> bool {
        self.segments.contains(&Segment::Field(Field::Item))
    }

    /// Render the topic for a node port
    pub fn render(&self, address: &Address, port: &str) -> String {
        let (port, item) = if self.has_item() {
            let kind = PortKind::of(port);
            let port = if kind == PortKind::Pin {
                format!("pin-{}", port_suffix(port))
            } else {
                port.to_string()
            };
            (port, kind.item())
        } else {
            (port.to_string(), "")
        };

        let topic: String = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Field(Field::Address) => address.as_str(),
                Segment::Field(Field::Port) => port.as_str(),
                Segment::Field(Field::Item) => item,
            })
            .collect();

        normalize_topic(&topic)
    }

    /// Extract the placeholder values from a topic
    ///
    /// Captures never span a `/`. Returns `None` when the topic does not
    /// match the template.
    pub fn parse(&self, topic: &str) -> Option<TopicFields> {
        let topic = normalize_topic(topic);
        let mut fields = TopicFields::default();
        if match_segments(&self.segments, &topic, &mut fields) {
            Some(fields)
        } else {
            None
        }
    }
}

fn match_segments(segments: &[Segment], text: &str, fields: &mut TopicFields) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return text.is_empty();
    };

    match first {
        Segment::Literal(literal) => text
            .strip_prefix(literal.as_str())
            .is_some_and(|remaining| match_segments(rest, remaining, fields)),
        Segment::Field(field) => {
            let limit = text.find('/').unwrap_or(text.len());
            // Shortest capture first, so a following literal anchors it
            for end in (1..=limit).filter(|end| text.is_char_boundary(*end)) {
                if match_segments(rest, &text[end..], fields) {
                    let value = Some(text[..end].to_string());
                    match field {
                        Field::Address => fields.address = value,
                        Field::Port => fields.port = value,
                        Field::Item => fields.item = value,
                    }
                    return true;
                }
            }
            false
        }
    }
}

/// Collapse repeated `/` and strip leading and trailing ones
pub fn normalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

// ============================================================================
// Routing Table
// ============================================================================

/// Bidirectional route table between node ports and bus topics
///
/// Static routes win over the patterns. Outbound topics for unrouted ports
/// are only synthesized when undefined topics are exposed; inbound topics
/// that are not `/set` actions of a static route are parsed with the input
/// pattern.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// (address, port) → topic
    routes: HashMap<(Address, String), String>,
    /// `<topic>/set` → (address, port)
    actions: HashMap<String, (Address, String)>,
    /// Pattern for outbound topics
    output_pattern: TopicPattern,
    /// Pattern for inbound topics
    input_pattern: TopicPattern,
    /// Synthesize topics for unrouted ports
    expose_undefined: bool,
}

impl RoutingTable {
    /// Create from bridge settings, loading the configured routes
    pub fn from_settings(settings: &BridgeSettings) -> Result<Self> {
        let mut table = Self {
            routes: HashMap::new(),
            actions: HashMap::new(),
            output_pattern: TopicPattern::new(&settings.default_topic_pattern)?,
            input_pattern: TopicPattern::new(&settings.input_topic_pattern())?,
            expose_undefined: settings.expose_undefined_topics,
        };
        table.load(&settings.routes);
        Ok(table)
    }

    /// Replace every static route with the given table
    ///
    /// Entries with an invalid address are skipped. Returns the number of
    /// routes loaded.
    pub fn load(&mut self, table: &RouteTable) -> usize {
        self.routes.clear();
        self.actions.clear();

        for (address, ports) in table {
            let address: Address = match address.parse() {
                Ok(address) => address,
                Err(e) => {
                    warn!("Skipping routes for {}: {}", address, e);
                    continue;
                }
            };
            for (port, topic) in ports {
                self.routes
                    .insert((address.clone(), port.clone()), topic.clone());
                self.actions
                    .insert(format!("{}/set", topic), (address.clone(), port.clone()));
            }
        }

        debug!(routes = self.routes.len(), "Routing table loaded");
        self.routes.len()
    }

    /// Topic for a node port, if it has one
    pub fn resolve_outbound(&self, address: &Address, port: &str) -> Option<String> {
        if let Some(topic) = self.routes.get(&(address.clone(), port.to_string())) {
            return Some(topic.clone());
        }
        if self.expose_undefined {
            let topic = self.output_pattern.render(address, port);
            trace!(address = %address, port, topic = %topic, "Synthesized topic");
            return Some(topic);
        }
        None
    }

    /// Node port addressed by an inbound topic
    pub fn resolve_inbound(&self, topic: &str) -> Option<(Address, String)> {
        if let Some(target) = self.actions.get(topic) {
            return Some(target.clone());
        }

        let fields = self.input_pattern.parse(topic)?;
        let address: Address = fields.address?.parse().ok()?;
        let mut port = fields.port?;

        if let Some(item) = fields.item.as_deref() {
            let kind = PortKind::from_item(item);
            if kind != PortKind::Other {
                port = with_kind(&port, kind);
            }
        }

        Some((address, port))
    }

    /// Inbound topic synthesized for a node port
    pub fn input_topic(&self, address: &Address, port: &str) -> String {
        self.input_pattern.render(address, port)
    }

    /// All static action topics (`<topic>/set`)
    pub fn action_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.actions.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Whether topics are synthesized for unrouted ports
    pub fn exposes_undefined(&self) -> bool {
        self.expose_undefined
    }

    /// Number of static routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether there are no static routes
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Iterate over static routes
    pub fn routes(&self) -> impl Iterator<Item = (&Address, &str, &str)> {
        self.routes
            .iter()
            .map(|((address, port), topic)| (address, port.as_str(), topic.as_str()))
    }
}
