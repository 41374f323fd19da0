//! VMware guestinfo announcements over the backdoor hypercall channel.
//!
//! On VMware the init publishes the hostname and NIC count so the
//! hypervisor UI can display them. The messages use the low-bandwidth
//! RPCI protocol: open a channel, send the command four bytes at a time,
//! close. Everything is best-effort; a failed hypercall only logs.

#[cfg(target_arch = "x86_64")]
mod backdoor {
    use std::arch::asm;

    const BDOOR_MAGIC: u32 = 0x564d_5868;
    const BDOOR_PORT: u16 = 0x5658;
    const BDOOR_CMD_MESSAGE: u32 = 0x1e;

    const RPCI_PROTOCOL: u32 = 0x4943_5052; // "RPCI"
    const GUESTMSG_FLAG_COOKIE: u32 = 0x8000_0000;

    const MSG_TYPE_OPEN: u32 = 0;
    const MSG_TYPE_SENDSIZE: u32 = 1;
    const MSG_TYPE_SENDPAYLOAD: u32 = 2;
    const MSG_TYPE_CLOSE: u32 = 6;

    const MSG_STATUS_SUCCESS: u32 = 0x0001;

    struct Regs {
        eax: u32,
        #[allow(dead_code)]
        ebx: u32,
        ecx: u32,
        edx: u32,
    }

    /// One low-bandwidth backdoor call. Only ever executed after the BIOS
    /// string identified a VMware hypervisor; the port read traps into
    /// the VMM instead of touching hardware. rbx is reserved by the
    /// compiler, so it is swapped in and out around the port read.
    unsafe fn call(ebx: u32, ecx: u32, edx: u32) -> Regs {
        let mut eax = BDOOR_MAGIC;
        let mut rbx = u64::from(ebx);
        let mut rcx = ecx;
        let mut rdx = u32::from(BDOOR_PORT) | edx;

        unsafe {
            asm!(
                "xchg rbx, {tmp}",
                "in eax, dx",
                "xchg rbx, {tmp}",
                tmp = inout(reg) rbx,
                inout("eax") eax,
                inout("ecx") rcx,
                inout("edx") rdx,
                options(nostack, preserves_flags),
            );
        }

        Regs {
            eax,
            ebx: rbx as u32,
            ecx: rcx,
            edx: rdx,
        }
    }

    fn msg_cmd(msg_type: u32) -> u32 {
        (msg_type << 16) | BDOOR_CMD_MESSAGE
    }

    fn status_ok(ecx: u32) -> bool {
        (ecx >> 16) & MSG_STATUS_SUCCESS != 0
    }

    /// Send one RPCI command string. The reply is not consumed; the
    /// channel is closed immediately after the payload.
    pub fn rpci_send(cmd: &str) -> Result<(), &'static str> {
        unsafe {
            let open = call(
                RPCI_PROTOCOL | GUESTMSG_FLAG_COOKIE,
                msg_cmd(MSG_TYPE_OPEN),
                0,
            );
            if !status_ok(open.ecx) {
                return Err("can not open rpci channel");
            }
            let channel = open.edx & 0xffff_0000;

            let size = call(cmd.len() as u32, msg_cmd(MSG_TYPE_SENDSIZE), channel);
            if !status_ok(size.ecx) {
                call(0, msg_cmd(MSG_TYPE_CLOSE), channel);
                return Err("can not send rpci size");
            }

            for chunk in cmd.as_bytes().chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                let sent = call(
                    u32::from_le_bytes(word),
                    msg_cmd(MSG_TYPE_SENDPAYLOAD),
                    channel,
                );
                if !status_ok(sent.ecx) {
                    call(0, msg_cmd(MSG_TYPE_CLOSE), channel);
                    return Err("can not send rpci payload");
                }
            }

            let closed = call(0, msg_cmd(MSG_TYPE_CLOSE), channel);
            let _ = closed.eax;
        }

        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
fn rpci_send(cmd: &str) -> Result<(), &'static str> {
    backdoor::rpci_send(cmd)
}

#[cfg(not(target_arch = "x86_64"))]
fn rpci_send(_cmd: &str) -> Result<(), &'static str> {
    Err("vmware backdoor not supported on this architecture")
}

/// Announce hostname and NIC count to the hypervisor.
pub fn start_vmtools(cards: usize, hostname: &str) {
    for cmd in [
        format!("info-set guestinfo.hostname {}", hostname),
        format!("info-set guestinfo.ethCount {}", cards),
    ] {
        if let Err(e) = rpci_send(&cmd) {
            tracing::debug!("vmtools: {}", e);
            return;
        }
    }
    tracing::debug!("vmtools announced {} cards for {}", cards, hostname);
}
