//! Resource naming and payload validation
//!
//! The backend is eventually consistent: a group that was just created may
//! come back without an IP or without instance views. Validation decides
//! which gaps are tolerable and fills in the tolerated ones.

use crate::error::{Error, Result};
use crate::models::{states, Container, ContainerGroup, ContainerState, OsType};
use tracing::debug;

/// Deterministic container group name for a pod
pub fn container_group_name(namespace: &str, pod_name: &str) -> String {
    format!("{}-{}", namespace, pod_name)
}

/// Check that a fetched container group carries the fields the provider
/// relies on.
///
/// A missing IP is tolerated while the group is still provisioning and is
/// replaced by an empty string.
pub fn validate_container_group(cg: &mut ContainerGroup) -> Result<()> {
    let name = cg
        .name
        .clone()
        .ok_or_else(|| Error::validation("container group name is nil"))?;
    if cg.id.is_none() {
        return Err(Error::validation(format!("container group {name} ID is nil")));
    }
    if cg.tags.is_none() {
        return Err(Error::validation(format!("container group {name} tags are nil")));
    }
    let properties = cg
        .properties
        .as_mut()
        .ok_or_else(|| Error::validation(format!("container group {name} properties are nil")))?;
    let containers = properties
        .containers
        .as_mut()
        .ok_or_else(|| Error::validation(format!("container group {name} containers are nil")))?;

    for container in containers.iter_mut() {
        validate_container(container)?;
    }

    if properties.os_type != Some(OsType::Windows) {
        let has_ip = properties
            .ip_address
            .as_ref()
            .map(|ip| ip.ip.is_some())
            .unwrap_or(false);

        if !has_ip {
            if properties.provisioning_state.as_deref() == Some(states::RUNNING) {
                return Err(Error::validation(format!(
                    "container group {name} is running but has no IP address"
                )));
            }

            debug!(
                container_group = %name,
                provisioning_state = ?properties.provisioning_state,
                "Container group has no IP yet"
            );
            properties.ip_address.get_or_insert_with(Default::default).ip = Some(String::new());
        }
    }

    Ok(())
}

/// Check a single container's mandatory fields.
///
/// A container that never restarted has no previous state; it gets a
/// `Pending` placeholder instead of failing.
pub fn validate_container(container: &mut Container) -> Result<()> {
    let name = container
        .name
        .clone()
        .ok_or_else(|| Error::validation("container name is nil"))?;
    let properties = container
        .properties
        .as_mut()
        .ok_or_else(|| Error::validation(format!("container {name} properties are nil")))?;

    if properties.ports.is_none() {
        return Err(Error::validation(format!("container {name} ports are nil")));
    }
    if properties.image.is_none() {
        return Err(Error::validation(format!("container {name} image is nil")));
    }

    let instance_view = properties
        .instance_view
        .as_mut()
        .ok_or_else(|| Error::validation(format!("container {name} instance view is nil")))?;
    let current_state = instance_view
        .current_state
        .as_ref()
        .ok_or_else(|| Error::validation(format!("container {name} current state is nil")))?;
    if current_state.start_time.is_none() {
        return Err(Error::validation(format!(
            "container {name} current state start time is nil"
        )));
    }

    if instance_view.previous_state.is_none() {
        instance_view.previous_state = Some(ContainerState {
            state: Some(states::PENDING.to_string()),
            detail_status: Some("Container has not been restarted".to_string()),
            ..Default::default()
        });
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::models::states;

    #[test]
    fn test_container_group_name() {
        assert_eq!(container_group_name("default", "web"), "default-web");
        assert_eq!(
            container_group_name("default", "web"),
            container_group_name("default", "web")
        );
        assert_ne!(
            container_group_name("kube-system", "dns"),
            container_group_name("default", "dns")
        );
    }

    #[test]
    fn test_valid_group_passes() {
        let mut cg = container_group("default-web", "vk");
        assert!(validate_container_group(&mut cg).is_ok());
        assert_eq!(cg.ip(), Some("10.0.0.4"));
    }

    #[test]
    fn test_missing_tags_fails() {
        let mut cg = container_group("default-web", "vk");
        cg.tags = None;
        let err = validate_container_group(&mut cg).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_missing_name_id_properties_containers_fail() {
        let mut cg = container_group("default-web", "vk");
        cg.name = None;
        assert!(validate_container_group(&mut cg).is_err());

        let mut cg = container_group("default-web", "vk");
        cg.id = None;
        assert!(validate_container_group(&mut cg).is_err());

        let mut cg = container_group("default-web", "vk");
        cg.properties.as_mut().unwrap().containers = None;
        assert!(validate_container_group(&mut cg).is_err());

        let mut cg = container_group("default-web", "vk");
        cg.properties = None;
        assert!(validate_container_group(&mut cg).is_err());
    }

    #[test]
    fn test_missing_ip_while_pending_is_coerced() {
        let mut cg = container_group("default-web", "vk");
        let props = cg.properties.as_mut().unwrap();
        props.ip_address = None;
        props.provisioning_state = Some(states::PENDING.to_string());

        validate_container_group(&mut cg).unwrap();
        assert_eq!(cg.ip(), Some(""));
    }

    #[test]
    fn test_missing_ip_while_running_fails() {
        let mut cg = container_group("default-web", "vk");
        cg.properties.as_mut().unwrap().ip_address = None;

        let err = validate_container_group(&mut cg).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_windows_group_without_ip_passes() {
        let mut cg = container_group("default-web", "vk");
        let props = cg.properties.as_mut().unwrap();
        props.ip_address = None;
        props.os_type = Some(OsType::Windows);

        validate_container_group(&mut cg).unwrap();
        assert_eq!(cg.ip(), None);
    }

    #[test]
    fn test_missing_previous_state_is_synthesized() {
        let mut c = container("web");
        validate_container(&mut c).unwrap();

        let previous = c
            .properties
            .unwrap()
            .instance_view
            .unwrap()
            .previous_state
            .unwrap();
        assert_eq!(previous.state.as_deref(), Some(states::PENDING));
    }

    #[test]
    fn test_container_missing_fields_fail() {
        let mut c = container("web");
        c.properties.as_mut().unwrap().image = None;
        assert!(validate_container(&mut c).is_err());

        let mut c = container("web");
        c.properties.as_mut().unwrap().ports = None;
        assert!(validate_container(&mut c).is_err());

        let mut c = container("web");
        c.properties
            .as_mut()
            .unwrap()
            .instance_view
            .as_mut()
            .unwrap()
            .current_state
            .as_mut()
            .unwrap()
            .start_time = None;
        assert!(validate_container(&mut c).is_err());

        let mut c = container("web");
        c.properties.as_mut().unwrap().instance_view = None;
        assert!(validate_container(&mut c).is_err());
    }
}
