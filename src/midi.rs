//! MIDI output backend.
//!
//! Thin wrapper over `midir` output connections: the global port
//! connects to a hardware device, per-track ports are created as
//! virtual outputs where the platform supports them.

use midir::{MidiOutput, MidiOutputConnection};

use crate::error::{Error, Result};

/// Wrapper for one MIDI output connection.
pub struct MidiOut {
    connection: MidiOutputConnection,
    pub port_name: String,
}

impl MidiOut {
    /// Connect to a hardware output port. With `port_match`, the first
    /// port whose name contains the substring is required to exist;
    /// otherwise the first available port is used.
    pub fn connect(client_name: &str, port_match: Option<&str>) -> Result<Self> {
        let midi_out = MidiOutput::new(client_name)
            .map_err(|e| Error::Midi(format!("failed to create MIDI output: {}", e)))?;

        let ports = midi_out.ports();
        if ports.is_empty() {
            return Err(Error::Midi("no MIDI output ports found".into()));
        }

        let port_idx = match port_match {
            Some(name) => ports
                .iter()
                .position(|p| {
                    midi_out
                        .port_name(p)
                        .map(|n| n.contains(name))
                        .unwrap_or(false)
                })
                .ok_or_else(|| Error::Midi(format!("no MIDI output port matches '{}'", name)))?,
            None => 0,
        };

        let port = &ports[port_idx];
        let port_name = midi_out
            .port_name(port)
            .unwrap_or_else(|_| "Unknown".to_string());

        let connection = midi_out
            .connect(port, client_name)
            .map_err(|e| Error::Midi(format!("failed to connect MIDI output: {}", e)))?;

        Ok(Self {
            connection,
            port_name,
        })
    }

    /// Create a virtual output port other clients can connect to.
    #[cfg(unix)]
    pub fn virtual_port(client_name: &str, port_name: &str) -> Result<Self> {
        use midir::os::unix::VirtualOutput;

        let midi_out = MidiOutput::new(client_name)
            .map_err(|e| Error::Midi(format!("failed to create MIDI output: {}", e)))?;
        let connection = midi_out
            .create_virtual(port_name)
            .map_err(|e| Error::Midi(format!("failed to create port '{}': {}", port_name, e)))?;

        Ok(Self {
            connection,
            port_name: port_name.to_string(),
        })
    }

    /// Send a raw MIDI message.
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        self.connection
            .send(message)
            .map_err(|e| Error::Midi(format!("failed to send MIDI: {}", e)))
    }
}
