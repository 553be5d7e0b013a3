//! Cloud resource identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kind of resource a detector inspects.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    Subscription,
    ResourceGroup,
    VirtualMachine,
    ApplicationInsights,
    LogAnalytics,
}

impl ResourceType {
    /// ARM provider path segment for resources below a resource group.
    fn provider_path(self) -> Option<&'static str> {
        match self {
            Self::Subscription | Self::ResourceGroup => None,
            Self::VirtualMachine => Some("Microsoft.Compute/virtualMachines"),
            Self::ApplicationInsights => Some("Microsoft.Insights/components"),
            Self::LogAnalytics => Some("Microsoft.OperationalInsights/workspaces"),
        }
    }
}

/// Identifies one resource. Ordered so request targets form a stable set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    pub resource_type: ResourceType,
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ResourceIdentifier {
    pub fn subscription(subscription_id: impl Into<String>) -> Self {
        Self {
            resource_type: ResourceType::Subscription,
            subscription_id: subscription_id.into(),
            resource_group: None,
            name: None,
        }
    }

    pub fn resource_group(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: ResourceType::ResourceGroup,
            subscription_id: subscription_id.into(),
            resource_group: Some(resource_group.into()),
            name: None,
        }
    }

    pub fn resource(
        resource_type: ResourceType,
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            subscription_id: subscription_id.into(),
            resource_group: Some(resource_group.into()),
            name: Some(name.into()),
        }
    }

    /// Check that the parts required by the resource type are present.
    pub fn validate(&self) -> Result<()> {
        if self.subscription_id.trim().is_empty() {
            return Err(Error::validation("resource subscription_id must not be empty"));
        }
        let needs_group = self.resource_type != ResourceType::Subscription;
        let needs_name = self.resource_type.provider_path().is_some();
        if needs_group && self.resource_group.as_deref().is_none_or(str::is_empty) {
            return Err(Error::validation(format!(
                "{} resource requires a resource_group",
                self.resource_type
            )));
        }
        if needs_name && self.name.as_deref().is_none_or(str::is_empty) {
            return Err(Error::validation(format!(
                "{} resource requires a name",
                self.resource_type
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/subscriptions/{}", self.subscription_id)?;
        if let Some(group) = &self.resource_group {
            write!(f, "/resourceGroups/{group}")?;
        }
        if let (Some(provider), Some(name)) = (self.resource_type.provider_path(), &self.name) {
            write!(f, "/providers/{provider}/{name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::str::FromStr;

    #[test]
    fn test_display_paths() {
        assert_eq!(
            ResourceIdentifier::subscription("sub-1").to_string(),
            "/subscriptions/sub-1"
        );
        assert_eq!(
            ResourceIdentifier::resource(ResourceType::VirtualMachine, "sub-1", "rg", "vm-01")
                .to_string(),
            "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm-01"
        );
    }

    #[test]
    fn test_validation() {
        assert!(ResourceIdentifier::subscription("sub").validate().is_ok());
        assert!(ResourceIdentifier::subscription("").validate().is_err());

        let mut vm = ResourceIdentifier::resource(ResourceType::VirtualMachine, "s", "rg", "vm");
        assert!(vm.validate().is_ok());
        vm.name = None;
        assert!(vm.validate().is_err());
    }

    #[test]
    fn test_set_is_ordered_and_deduplicated() {
        let a = ResourceIdentifier::resource(ResourceType::VirtualMachine, "s", "rg", "b");
        let b = ResourceIdentifier::resource(ResourceType::VirtualMachine, "s", "rg", "a");
        let set: BTreeSet<_> = [a.clone(), b.clone(), a.clone()].into_iter().collect();

        assert_eq!(set.len(), 2);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![b, a]);
    }

    #[test]
    fn test_resource_type_strings() {
        assert_eq!(ResourceType::ApplicationInsights.to_string(), "application_insights");
        assert_eq!(
            ResourceType::from_str("log_analytics").unwrap(),
            ResourceType::LogAnalytics
        );
        let json = serde_json::to_string(&ResourceType::VirtualMachine).unwrap();
        assert_eq!(json, "\"virtual_machine\"");
    }
}
