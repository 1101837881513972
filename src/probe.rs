// ============================================
// probe.rs - Is hardware virtualization already on?
// ============================================
//
// Two WMI signals, either one is enough:
//   - Win32_ComputerSystem.HypervisorPresent
//   - Win32_Processor.VirtualizationFirmwareEnabled
//
// The answer only decides whether we show the "enable virtualization in
// BIOS" advisory at the end, so any WMI failure simply means "no".
// ============================================

use tracing::debug;

/// Answers "is virtualization enabled on this machine?".
pub trait VirtualizationProbe: Send + Sync {
    /// Never fails: errors count as `false`.
    fn is_virtualization_enabled(&self) -> bool;
}

/// Probe backed by WMI on Windows. Always `false` elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct WmiProbe;

impl VirtualizationProbe for WmiProbe {
    fn is_virtualization_enabled(&self) -> bool {
        #[cfg(windows)]
        {
            match wmi_query::query_signals() {
                Ok(signals) => {
                    debug!(
                        "Virtualization signals: hypervisor_present={}, firmware_enabled={}",
                        signals.hypervisor_present, signals.firmware_enabled
                    );
                    signals.any()
                }
                Err(e) => {
                    debug!("WMI virtualization query failed: {}", e);
                    false
                }
            }
        }

        #[cfg(not(windows))]
        {
            debug!("Virtualization probe is Windows-only; reporting disabled");
            false
        }
    }
}

/// Raw answers from the two WMI classes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VirtualizationSignals {
    pub hypervisor_present: bool,
    pub firmware_enabled: bool,
}

impl VirtualizationSignals {
    pub fn any(&self) -> bool {
        self.hypervisor_present || self.firmware_enabled
    }
}

#[cfg(windows)]
mod wmi_query {
    use serde::Deserialize;
    use wmi::{COMLibrary, WMIConnection};

    use super::VirtualizationSignals;

    #[allow(non_camel_case_types)]
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    struct Win32_ComputerSystem {
        hypervisor_present: Option<bool>,
    }

    #[allow(non_camel_case_types)]
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    struct Win32_Processor {
        virtualization_firmware_enabled: Option<bool>,
    }

    pub fn query_signals() -> Result<VirtualizationSignals, wmi::WMIError> {
        let com = COMLibrary::new()?;
        let wmi = WMIConnection::new(com)?;

        let hypervisor_present = wmi
            .query::<Win32_ComputerSystem>()?
            .iter()
            .any(|s| s.hypervisor_present.unwrap_or(false));

        // Only needed when the first signal is off; a failure here
        // must not hide a positive hypervisor answer.
        let firmware_enabled = !hypervisor_present
            && wmi
                .query::<Win32_Processor>()
                .map(|cpus| {
                    cpus.iter()
                        .any(|c| c.virtualization_firmware_enabled.unwrap_or(false))
                })
                .unwrap_or(false);

        Ok(VirtualizationSignals {
            hypervisor_present,
            firmware_enabled,
        })
    }
}
