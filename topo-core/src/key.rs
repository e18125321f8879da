//! Key types and owned keys of topology entities.

use std::fmt;

/// Topology entity class.
///
/// Declaration order is also the storage order of keys, so rows of one key type are
/// contiguous inside a datastore container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyType {
    /// SDN controller connection.
    Controller,
    /// Controller domain.
    Domain,
    /// Logical port of one domain.
    LogicalPort,
    /// Physical port that is a member of one logical port.
    LogicalMemberPort,
    /// Switch learned from one controller.
    Switch,
    /// Physical switch port.
    Port,
    /// Neighbor information of one physical port.
    PortNeighbor,
    /// Link between two physical ports.
    Link,
    /// Boundary joining two controller domains.
    Boundary,
}

impl KeyType {
    /// Uppercase label used in logs and responses.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Controller => "CONTROLLER",
            Self::Domain => "DOMAIN",
            Self::LogicalPort => "LOGICAL_PORT",
            Self::LogicalMemberPort => "LOGICAL_MEMBER_PORT",
            Self::Switch => "SWITCH",
            Self::Port => "PORT",
            Self::PortNeighbor => "PORT_NEIGHBOR",
            Self::Link => "LINK",
            Self::Boundary => "BOUNDARY",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Owned key of one topology row, one variant per key type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopoKey {
    /// Controller key.
    Controller {
        /// Controller name.
        controller: String,
    },
    /// Domain key.
    Domain {
        /// Owning controller.
        controller: String,
        /// Domain name.
        domain: String,
    },
    /// Logical port key.
    LogicalPort {
        /// Owning controller.
        controller: String,
        /// Owning domain.
        domain: String,
        /// Logical port id.
        port_id: String,
    },
    /// Logical member port key.
    LogicalMemberPort {
        /// Owning controller.
        controller: String,
        /// Owning domain.
        domain: String,
        /// Parent logical port id.
        port_id: String,
        /// Switch of the member port.
        switch_id: String,
        /// Physical member port id.
        physical_port_id: String,
    },
    /// Switch key.
    Switch {
        /// Owning controller.
        controller: String,
        /// Switch id.
        switch_id: String,
    },
    /// Physical port key.
    Port {
        /// Owning controller.
        controller: String,
        /// Owning switch.
        switch_id: String,
        /// Port id.
        port_id: String,
    },
    /// Port neighbor key.
    PortNeighbor {
        /// Owning controller.
        controller: String,
        /// Owning switch.
        switch_id: String,
        /// Port id.
        port_id: String,
    },
    /// Link key.
    Link {
        /// Owning controller.
        controller: String,
        /// Source switch.
        switch_id1: String,
        /// Source port.
        port_id1: String,
        /// Destination switch.
        switch_id2: String,
        /// Destination port.
        port_id2: String,
    },
    /// Boundary key.
    Boundary {
        /// Boundary id.
        boundary_id: String,
    },
}

impl TopoKey {
    /// Builds a controller key.
    #[must_use]
    pub fn controller(controller: impl Into<String>) -> Self {
        Self::Controller {
            controller: controller.into(),
        }
    }

    /// Builds a domain key.
    #[must_use]
    pub fn domain(controller: impl Into<String>, domain: impl Into<String>) -> Self {
        Self::Domain {
            controller: controller.into(),
            domain: domain.into(),
        }
    }

    /// Builds a logical port key.
    #[must_use]
    pub fn logical_port(
        controller: impl Into<String>,
        domain: impl Into<String>,
        port_id: impl Into<String>,
    ) -> Self {
        Self::LogicalPort {
            controller: controller.into(),
            domain: domain.into(),
            port_id: port_id.into(),
        }
    }

    /// Builds a switch key.
    #[must_use]
    pub fn switch(controller: impl Into<String>, switch_id: impl Into<String>) -> Self {
        Self::Switch {
            controller: controller.into(),
            switch_id: switch_id.into(),
        }
    }

    /// Builds a physical port key.
    #[must_use]
    pub fn port(
        controller: impl Into<String>,
        switch_id: impl Into<String>,
        port_id: impl Into<String>,
    ) -> Self {
        Self::Port {
            controller: controller.into(),
            switch_id: switch_id.into(),
            port_id: port_id.into(),
        }
    }

    /// Builds a boundary key.
    #[must_use]
    pub fn boundary(boundary_id: impl Into<String>) -> Self {
        Self::Boundary {
            boundary_id: boundary_id.into(),
        }
    }

    /// Key type of this key.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Controller { .. } => KeyType::Controller,
            Self::Domain { .. } => KeyType::Domain,
            Self::LogicalPort { .. } => KeyType::LogicalPort,
            Self::LogicalMemberPort { .. } => KeyType::LogicalMemberPort,
            Self::Switch { .. } => KeyType::Switch,
            Self::Port { .. } => KeyType::Port,
            Self::PortNeighbor { .. } => KeyType::PortNeighbor,
            Self::Link { .. } => KeyType::Link,
            Self::Boundary { .. } => KeyType::Boundary,
        }
    }

    /// Owning controller, `None` for boundaries which span two controllers.
    #[must_use]
    pub fn controller_name(&self) -> Option<&str> {
        match self {
            Self::Controller { controller }
            | Self::Domain { controller, .. }
            | Self::LogicalPort { controller, .. }
            | Self::LogicalMemberPort { controller, .. }
            | Self::Switch { controller, .. }
            | Self::Port { controller, .. }
            | Self::PortNeighbor { controller, .. }
            | Self::Link { controller, .. } => Some(controller),
            Self::Boundary { .. } => None,
        }
    }

    /// Key of the row this key depends on, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        match self {
            Self::Controller { .. } | Self::Boundary { .. } => None,
            Self::Domain { controller, .. } | Self::Switch { controller, .. } => {
                Some(Self::controller(controller.clone()))
            }
            Self::LogicalPort {
                controller, domain, ..
            } => Some(Self::domain(controller.clone(), domain.clone())),
            Self::LogicalMemberPort {
                controller,
                domain,
                port_id,
                ..
            } => Some(Self::logical_port(
                controller.clone(),
                domain.clone(),
                port_id.clone(),
            )),
            Self::Port {
                controller,
                switch_id,
                ..
            } => Some(Self::switch(controller.clone(), switch_id.clone())),
            Self::PortNeighbor {
                controller,
                switch_id,
                port_id,
            } => Some(Self::port(
                controller.clone(),
                switch_id.clone(),
                port_id.clone(),
            )),
            Self::Link {
                controller,
                switch_id1,
                ..
            } => Some(Self::switch(controller.clone(), switch_id1.clone())),
        }
    }
}

impl fmt::Display for TopoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controller { controller } => write!(f, "controller:{controller}"),
            Self::Domain { controller, domain } => write!(f, "domain:{controller}/{domain}"),
            Self::LogicalPort {
                controller,
                domain,
                port_id,
            } => write!(f, "logical_port:{controller}/{domain}/{port_id}"),
            Self::LogicalMemberPort {
                controller,
                domain,
                port_id,
                switch_id,
                physical_port_id,
            } => write!(
                f,
                "logical_member_port:{controller}/{domain}/{port_id}/{switch_id}/{physical_port_id}"
            ),
            Self::Switch {
                controller,
                switch_id,
            } => write!(f, "switch:{controller}/{switch_id}"),
            Self::Port {
                controller,
                switch_id,
                port_id,
            } => write!(f, "port:{controller}/{switch_id}/{port_id}"),
            Self::PortNeighbor {
                controller,
                switch_id,
                port_id,
            } => write!(f, "port_neighbor:{controller}/{switch_id}/{port_id}"),
            Self::Link {
                controller,
                switch_id1,
                port_id1,
                switch_id2,
                port_id2,
            } => write!(
                f,
                "link:{controller}/{switch_id1}/{port_id1}-{switch_id2}/{port_id2}"
            ),
            Self::Boundary { boundary_id } => write!(f, "boundary:{boundary_id}"),
        }
    }
}
