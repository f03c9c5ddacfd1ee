// VirtualMachine command implementations
//
// These are the fundamental commands for interacting with the debuggee VM

use crate::commands::{command_sets, vm_commands};
use crate::protocol::{CommandPacket, HarnessResult};
use crate::reader::{read_i32, read_string, read_u64, read_u8};
use crate::session::CommandSession;
use crate::types::{ReferenceTypeId, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// VM version information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmVersion {
    pub description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub vm_version: String,
    pub vm_name: String,
}

/// ID sizes used by the VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmIdSizes {
    pub field_id_size: i32,
    pub method_id_size: i32,
    pub object_id_size: i32,
    pub reference_type_id_size: i32,
    pub frame_id_size: i32,
}

/// Class information from ClassesBySignature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub ref_type_tag: u8, // 1=class, 2=interface, 3=array
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: i32,
}

impl CommandSession {
    fn vm_command(&self, command: u8) -> CommandPacket {
        CommandPacket::new(self.next_id(), command_sets::VIRTUAL_MACHINE, command)
    }

    /// Get VM version information (VirtualMachine.Version command)
    pub async fn version(&self) -> HarnessResult<VmVersion> {
        let reply = self.command(self.vm_command(vm_commands::VERSION)).await?;
        let mut data = reply.data();

        let description = read_string(&mut data)?;
        let jdwp_major = read_i32(&mut data)?;
        let jdwp_minor = read_i32(&mut data)?;
        let vm_version = read_string(&mut data)?;
        let vm_name = read_string(&mut data)?;

        Ok(VmVersion {
            description,
            jdwp_major,
            jdwp_minor,
            vm_version,
            vm_name,
        })
    }

    /// Get ID sizes (VirtualMachine.IDSizes command)
    pub async fn id_sizes(&self) -> HarnessResult<VmIdSizes> {
        let reply = self.command(self.vm_command(vm_commands::ID_SIZES)).await?;
        let mut data = reply.data();

        Ok(VmIdSizes {
            field_id_size: read_i32(&mut data)?,
            method_id_size: read_i32(&mut data)?,
            object_id_size: read_i32(&mut data)?,
            reference_type_id_size: read_i32(&mut data)?,
            frame_id_size: read_i32(&mut data)?,
        })
    }

    /// Get all live threads (VirtualMachine.AllThreads)
    pub async fn all_threads(&self) -> HarnessResult<Vec<ThreadId>> {
        let reply = self.command(self.vm_command(vm_commands::ALL_THREADS)).await?;
        let mut data = reply.data();

        let threads_count = read_i32(&mut data)?;
        let mut threads = Vec::with_capacity(threads_count.clamp(0, 1024) as usize);
        for _ in 0..threads_count {
            threads.push(read_u64(&mut data)?);
        }

        Ok(threads)
    }

    /// Find classes by signature (VirtualMachine.ClassesBySignature command)
    /// Signature format: "Lcom/example/MyClass;" for classes
    pub async fn classes_by_signature(&self, signature: &str) -> HarnessResult<Vec<ClassInfo>> {
        let mut packet = self.vm_command(vm_commands::CLASSES_BY_SIGNATURE);

        // Write signature as a string (4-byte length + UTF-8 bytes)
        let sig_bytes = signature.as_bytes();
        packet.data.put_u32(sig_bytes.len() as u32);
        packet.data.extend_from_slice(sig_bytes);

        let reply = self.command(packet).await?;
        let mut data = reply.data();

        let classes_count = read_i32(&mut data)?;
        let mut classes = Vec::with_capacity(classes_count.clamp(0, 1024) as usize);

        for _ in 0..classes_count {
            let ref_type_tag = read_u8(&mut data)?;
            let type_id = read_u64(&mut data)?;
            let status = read_i32(&mut data)?;

            classes.push(ClassInfo {
                ref_type_tag,
                type_id,
                signature: signature.to_string(),
                status,
            });
        }

        Ok(classes)
    }

    /// Suspend all threads (VirtualMachine.Suspend)
    pub async fn suspend_all(&self) -> HarnessResult<()> {
        self.command(self.vm_command(vm_commands::SUSPEND)).await?;
        self.suspend_state().suspend_all();
        Ok(())
    }

    /// Resume all threads (VirtualMachine.Resume)
    ///
    /// The local count drops before the command goes out: once the debuggee
    /// runs, a suspending event may arrive at any moment and must count on
    /// top of the resumed state.
    pub async fn resume_all(&self) -> HarnessResult<()> {
        let resumed = self.suspend_state().resume_all();
        if resumed.is_empty() {
            debug!("Resuming VM that is not recorded as suspended");
        }

        if let Err(e) = self.command(self.vm_command(vm_commands::RESUME)).await {
            self.suspend_state().restore_resume_all(&resumed);
            return Err(e);
        }
        Ok(())
    }

    /// Terminate the debuggee with an exit code (VirtualMachine.Exit)
    pub async fn exit(&self, exit_code: i32) -> HarnessResult<()> {
        info!("Requesting debuggee exit with code {}", exit_code);
        let mut packet = self.vm_command(vm_commands::EXIT);
        packet.data.put_i32(exit_code);
        self.command(packet).await?;
        Ok(())
    }

    /// Detach from the debuggee (VirtualMachine.Dispose)
    pub async fn dispose(&self) -> HarnessResult<()> {
        info!("Disposing debugger connection");
        self.command(self.vm_command(vm_commands::DISPOSE)).await?;
        self.suspend_state().reset();
        Ok(())
    }
}
