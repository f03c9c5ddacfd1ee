// ReferenceType command implementations
//
// Commands for working with classes, interfaces, and arrays

use crate::commands::{command_sets, reference_type_commands};
use crate::protocol::{CommandPacket, HarnessResult};
use crate::reader::{read_i32, read_string, read_value};
use crate::session::CommandSession;
use crate::types::{ReferenceTypeId, Value};
use bytes::BufMut;

impl CommandSession {
    /// Get the JNI signature of a reference type (ReferenceType.Signature)
    pub async fn signature(&self, ref_type_id: ReferenceTypeId) -> HarnessResult<String> {
        let mut packet = CommandPacket::new(
            self.next_id(),
            command_sets::REFERENCE_TYPE,
            reference_type_commands::SIGNATURE,
        );
        packet.data.put_u64(ref_type_id);

        let reply = self.command(packet).await?;
        let mut data = reply.data();
        read_string(&mut data)
    }

    /// Get reachable instances of a type (ReferenceType.Instances)
    ///
    /// `max_instances` of 0 means all; a negative value is rejected by the
    /// debuggee with ILLEGAL_ARGUMENT.
    pub async fn instances(
        &self,
        ref_type_id: ReferenceTypeId,
        max_instances: i32,
    ) -> HarnessResult<Vec<Value>> {
        let mut packet = CommandPacket::new(
            self.next_id(),
            command_sets::REFERENCE_TYPE,
            reference_type_commands::INSTANCES,
        );
        packet.data.put_u64(ref_type_id);
        packet.data.put_i32(max_instances);

        let reply = self.command(packet).await?;
        self.decoded(read_instances(reply.data())).await
    }
}

fn read_instances(mut data: &[u8]) -> HarnessResult<Vec<Value>> {
    let count = read_i32(&mut data)?;
    let mut instances = Vec::with_capacity(count.clamp(0, 1024) as usize);
    for _ in 0..count {
        instances.push(read_value(&mut data)?);
    }
    Ok(instances)
}
