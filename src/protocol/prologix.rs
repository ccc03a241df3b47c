//! Prologix GPIB-USB controller commands.

use super::command::Command;
use std::time::Duration;

/// Set or query the GPIB address.
pub const ADDR: &str = "++addr";
/// Assert interface clear, making the adapter controller-in-charge.
pub const IFC: &str = "++ifc";
/// Select CONTROLLER mode.
pub const MODE_CONTROLLER: &str = "++mode 1";
/// Assert EOI with the last byte of every transmit.
pub const EOI_ON: &str = "++eoi 1";
/// Append CR+LF to data sent to the instrument.
pub const EOS_CRLF: &str = "++eos 0";
/// Enable read-after-write.
pub const AUTO_ON: &str = "++auto 1";
/// Disable read-after-write.
pub const AUTO_OFF: &str = "++auto 0";
/// Read until timeout or EOI.
pub const READ: &str = "++read";
/// Prefix of the inter-character read timeout command.
pub const READ_TMO_MS: &str = "++read_tmo_ms";
/// Query the adapter firmware version.
pub const VER: &str = "++ver";

/// `++addr <n>`
pub fn addr(address: u8) -> Command {
    Command::controller(&format!("{} {}", ADDR, address))
}

/// `++read_tmo_ms <n>`
pub fn read_timeout(timeout: Duration) -> Command {
    Command::controller(&format!("{} {}", READ_TMO_MS, timeout.as_millis()))
}

/// Ordered bring-up sequence sent right after the port opens.
///
/// The version query is diagnostic only; its reply comes back through the normal
/// receive path.
pub fn bring_up(gpib_address: Option<u8>, timeout: Duration) -> Vec<Command> {
    let mut commands = vec![Command::controller(IFC), Command::controller(MODE_CONTROLLER)];
    if let Some(address) = gpib_address {
        commands.push(addr(address));
    }
    commands.extend([
        Command::controller(EOI_ON),
        Command::controller(EOS_CRLF),
        Command::controller(AUTO_ON),
        read_timeout(timeout),
        Command::controller(VER),
    ]);
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raws(commands: &[Command]) -> Vec<&str> {
        commands.iter().map(Command::raw).collect()
    }

    #[test]
    fn test_bring_up_order() {
        let commands = bring_up(None, Duration::from_millis(500));
        assert_eq!(
            raws(&commands),
            vec![
                "++ifc",
                "++mode 1",
                "++eoi 1",
                "++eos 0",
                "++auto 1",
                "++read_tmo_ms 500",
                "++ver"
            ]
        );
        assert!(commands.iter().all(Command::is_controller));
    }

    #[test]
    fn test_bring_up_with_address() {
        let commands = bring_up(Some(15), Duration::from_millis(750));
        assert_eq!(raws(&commands)[2], "++addr 15");
        assert_eq!(raws(&commands)[6], "++read_tmo_ms 750");
        assert_eq!(commands.len(), 8);
    }
}
