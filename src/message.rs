//! Message passing from the control thread to the render thread
//!
//! All graph mutations travel a single FIFO channel and are drained exactly
//! once per render quantum, so a sequence of edits issued together becomes
//! audible together.

use crossbeam_channel::Sender;

use crate::buffer::ChannelConfig;
use crate::param::AutomationMessage;
use crate::process::AudioProcessor;

pub(crate) enum ControlMessage {
    /// Insert a new node into the render graph
    RegisterNode {
        id: u64,
        node: Box<dyn AudioProcessor>,
        inputs: usize,
        outputs: usize,
        channel_config: ChannelConfig,
    },

    /// Wire `from`'s output port to `to`'s input port. The reserved input
    /// port `u32::MAX` denotes a parameter attachment: it orders the source
    /// before `to` without feeding `to`'s summing junctions.
    ConnectNode {
        from: u64,
        to: u64,
        output: u32,
        input: u32,
    },

    /// Sever all edges between the two nodes
    DisconnectNode { from: u64, to: u64 },

    /// Sever all outgoing edges of this node
    DisconnectAll { from: u64 },

    /// Sever all inbound edges of this node
    DisconnectAllTo { to: u64 },

    /// The control-side handle was dropped; release the node once it no
    /// longer produces or carries signal
    FreeWhenFinished { id: u64 },

    /// Pass an automation event to a parameter's render-side timeline.
    ///
    /// Wrapping the parameter's own sender keeps timeline edits in FIFO
    /// order with the surrounding graph edits.
    AudioParamEvent {
        to: Sender<AutomationMessage>,
        event: AutomationMessage,
    },

    /// Render this node every quantum even when nothing consumes it
    AddAutomaticPullNode { id: u64 },

    /// Undo `AddAutomaticPullNode`
    RemoveAutomaticPullNode { id: u64 },

    /// Edits batched under the context's graph-lock scope; applied
    /// back-to-back within a single drain
    Batch(Vec<ControlMessage>),
}
