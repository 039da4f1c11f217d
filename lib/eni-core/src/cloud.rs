//! Cloud network control plane as consumed by the engine

use async_trait::async_trait;
use eni_api::{Network, Subnet};
use std::net::Ipv4Addr;
use thiserror::Error;

pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Response codes returned by the control plane
pub mod codes {
    pub const REQUEST_LIMIT_EXCEEDED: &str = "RequestLimitExceeded";
    pub const THROTTLING: &str = "Throttling";
    pub const SERVICE_UNAVAILABLE: &str = "ServiceUnavailable";
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const REQUEST_TIMEOUT: &str = "RequestTimeout";
    pub const INTERFACE_NOT_FOUND: &str = "InvalidNetworkInterfaceID.NotFound";
    pub const INTERFACE_IN_USE: &str = "InvalidNetworkInterface.InUse";
    pub const ATTACHMENT_NOT_FOUND: &str = "InvalidAttachmentID.NotFound";
    pub const ATTACHMENT_LIMIT_EXCEEDED: &str = "AttachmentLimitExceeded";
    pub const SUBNET_NOT_FOUND: &str = "InvalidSubnetID.NotFound";
    pub const NETWORK_NOT_FOUND: &str = "InvalidVpcID.NotFound";
    pub const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";
    pub const INSUFFICIENT_ADDRESSES: &str = "InsufficientFreeAddressesInSubnet";
    pub const INVALID_PARAMETER: &str = "InvalidParameterValue";
    pub const UNAUTHORIZED: &str = "UnauthorizedOperation";
}

/// How the engine should react to a failed call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Throttling, timeouts and "not yet visible" reads; retry with backoff
    Transient,
    /// Everything else; propagate without retry
    Terminal,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct CloudError {
    pub code: String,
    pub message: String,
}

impl CloudError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn throttled() -> Self {
        Self::new(codes::REQUEST_LIMIT_EXCEEDED, "Request limit exceeded")
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(codes::REQUEST_TIMEOUT, format!("{} timed out", operation))
    }

    pub fn interface_not_found(interface_id: &str) -> Self {
        Self::new(
            codes::INTERFACE_NOT_FOUND,
            format!("The networkInterface ID '{}' does not exist", interface_id),
        )
    }

    /// A newly created interface in a describe call that lags behind creation
    /// shows up as not-found; the same code covers "not yet visible".
    pub fn not_yet_visible(interface_id: &str) -> Self {
        Self::new(
            codes::INTERFACE_NOT_FOUND,
            format!("Interface '{}' not yet visible", interface_id),
        )
    }

    pub fn class(&self) -> ErrorClass {
        match self.code.as_str() {
            codes::REQUEST_LIMIT_EXCEEDED
            | codes::THROTTLING
            | codes::SERVICE_UNAVAILABLE
            | codes::INTERNAL_ERROR
            | codes::REQUEST_TIMEOUT
            | codes::INTERFACE_NOT_FOUND
            | codes::INTERFACE_IN_USE => ErrorClass::Transient,
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_code(&self, code: &str) -> bool {
        self.code == code
    }
}

/// Attachment of an interface to an instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub instance_id: String,
    pub device_index: u32,
}

/// Result of `DescribeInterface`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDescription {
    pub id: String,
    pub subnet_id: String,
    pub primary_address: Ipv4Addr,
    pub secondary_addresses: Vec<Ipv4Addr>,
    pub attachment: Option<Attachment>,
}

/// Result of `DescribeInstance`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceDescription {
    pub id: String,
    pub network_id: String,
    pub primary_address: Ipv4Addr,
    /// Attached interfaces ordered by device index
    pub interfaces: Vec<InterfaceDescription>,
}

impl InstanceDescription {
    /// The interface at device index 0
    pub fn primary_interface(&self) -> Option<&InterfaceDescription> {
        self.interfaces.iter().find(|iface| {
            iface
                .attachment
                .as_ref()
                .is_some_and(|att| att.device_index == 0)
        })
    }
}

/// Remote network control plane. Every call is idempotent on retry from the
/// engine's point of view and may be throttled.
#[async_trait]
pub trait CloudControlPlane: Send + Sync {
    /// Create an interface in `subnet_id` with `address_count` secondary
    /// addresses. A repeated `client_token` returns the interface the first
    /// request created instead of a new one.
    async fn create_interface(
        &self,
        subnet_id: &str,
        address_count: u32,
        client_token: &str,
    ) -> CloudResult<String>;

    async fn attach_interface(
        &self,
        interface_id: &str,
        instance_id: &str,
        device_index: u32,
    ) -> CloudResult<()>;

    async fn detach_interface(&self, interface_id: &str) -> CloudResult<()>;

    async fn delete_interface(&self, interface_id: &str) -> CloudResult<()>;

    async fn describe_interface(&self, interface_id: &str) -> CloudResult<InterfaceDescription>;

    async fn describe_instance(&self, instance_id: &str) -> CloudResult<InstanceDescription>;

    async fn describe_subnet(&self, subnet_id: &str) -> CloudResult<Subnet>;

    /// All subnets of a network, with their tags
    async fn describe_subnets(&self, network_id: &str) -> CloudResult<Vec<Subnet>>;

    async fn describe_network(&self, network_id: &str) -> CloudResult<Network>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_is_transient() {
        assert!(CloudError::throttled().is_retryable());
        assert!(CloudError::new(codes::THROTTLING, "slow down").is_retryable());
        assert!(CloudError::timeout("CreateInterface").is_retryable());
    }

    #[test]
    fn test_not_yet_visible_is_transient() {
        assert_eq!(CloudError::not_yet_visible("eni-1").class(), ErrorClass::Transient);
    }

    #[test]
    fn test_terminal_codes() {
        for code in [
            codes::UNAUTHORIZED,
            codes::SUBNET_NOT_FOUND,
            codes::INSUFFICIENT_ADDRESSES,
            codes::ATTACHMENT_LIMIT_EXCEEDED,
            "SomethingUnexpected",
        ] {
            assert_eq!(CloudError::new(code, "x").class(), ErrorClass::Terminal, "{}", code);
        }
    }

    #[test]
    fn test_display_includes_code() {
        let err = CloudError::new(codes::UNAUTHORIZED, "denied");
        assert_eq!(err.to_string(), "UnauthorizedOperation: denied");
    }
}
