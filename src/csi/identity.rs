//! Identity Service

use super::types::*;
use crate::DriverInfo;
use std::collections::BTreeMap;

/// Identity role, served in both controller and node mode
pub struct IdentityService {
    driver: DriverInfo,
    controller: bool,
}

impl IdentityService {
    pub fn new(driver: DriverInfo, controller: bool) -> Self {
        Self { driver, controller }
    }

    pub fn get_plugin_info(&self) -> GetPluginInfoResponse {
        GetPluginInfoResponse {
            name: self.driver.name.clone(),
            vendor_version: self.driver.version.clone(),
            manifest: BTreeMap::new(),
        }
    }

    pub fn get_plugin_capabilities(&self) -> GetPluginCapabilitiesResponse {
        let mut capabilities = Vec::with_capacity(3);
        if self.controller {
            capabilities.push(PluginCapability::ControllerService);
        }
        capabilities.push(PluginCapability::VolumeAccessibilityConstraints);
        capabilities.push(PluginCapability::ExpandOnline);

        GetPluginCapabilitiesResponse { capabilities }
    }

    pub fn probe(&self) -> ProbeResponse {
        ProbeResponse { ready: true }
    }
}
