//! The render-side audio graph and its per-quantum processing loop

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::{AudioBuffer, ChannelCountMode, ChannelConfig};
use crate::bus::AudioBus;
use crate::message::ControlMessage;
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{SampleRate, RENDER_QUANTUM_SIZE};

/// Reserved input port wiring a parameter processor to its owner node.
///
/// Edges into this port establish render order and lifetime, but do not feed
/// the owner's summing junctions.
pub(crate) const PARAM_INPUT: u32 = u32::MAX;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeIndex(pub u64);

/// Operations running off the system-level audio callback
pub(crate) struct RenderThread {
    graph: Graph,
    sample_rate: SampleRate,
    channels: usize,
    frames_played: Arc<AtomicU64>,
    receiver: Receiver<ControlMessage>,
    reclaim: Sender<Node>,
}

impl RenderThread {
    pub fn new(
        sample_rate: SampleRate,
        channels: usize,
        receiver: Receiver<ControlMessage>,
        frames_played: Arc<AtomicU64>,
        reclaim: Sender<Node>,
    ) -> Self {
        Self {
            graph: Graph::new(),
            sample_rate,
            channels,
            frames_played,
            receiver,
            reclaim,
        }
    }

    fn handle_control_messages(&mut self) {
        // non-blocking drain, once per quantum
        for message in self.receiver.try_iter() {
            Self::apply(&mut self.graph, message);
        }
    }

    fn apply(graph: &mut Graph, message: ControlMessage) {
        use ControlMessage::*;

        match message {
            RegisterNode {
                id,
                node,
                inputs,
                outputs,
                channel_config,
            } => {
                graph.add_node(NodeIndex(id), node, inputs, outputs, channel_config);
            }
            ConnectNode {
                from,
                to,
                output,
                input,
            } => {
                graph.add_edge((NodeIndex(from), output), (NodeIndex(to), input));
            }
            DisconnectNode { from, to } => {
                graph.remove_edge(NodeIndex(from), NodeIndex(to));
            }
            DisconnectAll { from } => {
                graph.remove_edges_from(NodeIndex(from));
            }
            DisconnectAllTo { to } => {
                graph.remove_edges_to(NodeIndex(to));
            }
            FreeWhenFinished { id } => {
                graph.mark_free_when_finished(NodeIndex(id));
            }
            AudioParamEvent { to, event } => {
                // forwarded to the param processor's own queue; it drains
                // when it renders this quantum
                let _ = to.send(event);
            }
            AddAutomaticPullNode { id } => {
                graph.add_automatic_pull_node(NodeIndex(id));
            }
            RemoveAutomaticPullNode { id } => {
                graph.remove_automatic_pull_node(NodeIndex(id));
            }
            Batch(messages) => {
                for message in messages {
                    Self::apply(graph, message);
                }
            }
        }
    }

    /// Render a block of interleaved output samples, one quantum at a time.
    pub fn render(&mut self, data: &mut [f32]) {
        let chunk_size = RENDER_QUANTUM_SIZE * self.channels;
        for chunk in data.chunks_mut(chunk_size) {
            self.render_quantum_into(chunk);
        }
    }

    fn render_quantum_into(&mut self, data: &mut [f32]) {
        // handle addition/removal of nodes/edges
        self.handle_control_messages();

        // update time
        let frames = data.len() / self.channels;
        let rate = self.sample_rate.0 as f64;
        let timestamp = self.frames_played.fetch_add(frames as u64, Ordering::SeqCst) as f64 / rate;

        // render the graph
        let rendered = self.graph.render(timestamp, self.sample_rate);

        // copy rendered audio into the interleaved output slice
        for i in 0..self.channels {
            let output = data.iter_mut().skip(i).step_by(self.channels);
            if i < rendered.number_of_channels() {
                let channel = rendered.channel_data(i).as_slice().iter();
                for (sample, rendered) in output.zip(channel) {
                    *sample = *rendered;
                }
            } else {
                for sample in output {
                    *sample = 0.;
                }
            }
        }

        // release nodes that finished or lost their last consumer
        self.graph.collect_finished(&self.reclaim);
    }

    /// Render the graph into a single buffer, as fast as possible.
    ///
    /// Used by the offline context; per-quantum semantics are identical to
    /// realtime rendering.
    pub fn render_audiobuffer(&mut self, length: usize) -> AudioBuffer {
        let mut buffer = AudioBuffer::new(self.channels, 0, self.sample_rate);
        let rate = self.sample_rate.0 as f64;

        let quanta = (length + RENDER_QUANTUM_SIZE - 1) / RENDER_QUANTUM_SIZE;
        for _ in 0..quanta {
            self.handle_control_messages();

            let timestamp =
                self.frames_played.fetch_add(RENDER_QUANTUM_SIZE as u64, Ordering::SeqCst) as f64
                    / rate;

            let rendered = self.graph.render(timestamp, self.sample_rate);
            buffer.extend_from_bus(rendered);

            self.graph.collect_finished(&self.reclaim);
        }

        buffer
    }
}

/// Render-side state of a single node: its processor and buffers.
pub(crate) struct Node {
    processor: Box<dyn AudioProcessor>,
    /// rendered output buses, one per output port
    buffers: Vec<AudioBus>,
    /// summing junction buses, one per input port, reused across quanta
    input_buses: Vec<AudioBus>,
    channel_config: ChannelConfig,
    /// the control-side handle was dropped
    free_when_finished: bool,
    /// quantum end time of the last non-silent output
    last_non_silent_time: f64,
}

impl Node {
    /// The bus of the first output port (parameter processors publish their
    /// computed values here).
    pub fn get_buffer(&self) -> &AudioBus {
        &self.buffers[0]
    }
}

pub(crate) struct Graph {
    nodes: HashMap<NodeIndex, Node>,

    // connections, from (node,output) to (node,input)
    edges: HashSet<((NodeIndex, u32), (NodeIndex, u32))>,

    // inspector nodes rendered even when nothing consumes them
    automatic_pull: HashSet<NodeIndex>,

    marked: Vec<NodeIndex>,
    ordered: Vec<NodeIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: HashMap::new(),
            edges: HashSet::new(),
            automatic_pull: HashSet::new(),
            ordered: vec![],
            marked: vec![],
        }
    }

    pub fn add_node(
        &mut self,
        index: NodeIndex,
        processor: Box<dyn AudioProcessor>,
        inputs: usize,
        outputs: usize,
        channel_config: ChannelConfig,
    ) {
        self.nodes.insert(
            index,
            Node {
                processor,
                buffers: vec![AudioBus::new(1); outputs],
                input_buses: vec![AudioBus::new(1); inputs],
                channel_config,
                free_when_finished: false,
                last_non_silent_time: f64::NEG_INFINITY,
            },
        );

        self.order_nodes();
    }

    pub fn add_edge(&mut self, source: (NodeIndex, u32), dest: (NodeIndex, u32)) {
        self.edges.insert((source, dest));

        self.order_nodes();
    }

    pub fn remove_edge(&mut self, source: NodeIndex, dest: NodeIndex) {
        self.edges.retain(|&(s, d)| s.0 != source || d.0 != dest);

        self.order_nodes();
    }

    pub fn remove_edges_from(&mut self, source: NodeIndex) {
        self.edges.retain(|&(s, _d)| s.0 != source);

        self.order_nodes();
    }

    pub fn remove_edges_to(&mut self, dest: NodeIndex) {
        // parameter attachments survive, they share the owner's lifetime
        self.edges
            .retain(|&(_s, d)| d.0 != dest || d.1 == PARAM_INPUT);

        self.order_nodes();
    }

    pub fn mark_free_when_finished(&mut self, index: NodeIndex) {
        if let Some(node) = self.nodes.get_mut(&index) {
            node.free_when_finished = true;
        }
    }

    pub fn add_automatic_pull_node(&mut self, index: NodeIndex) {
        self.automatic_pull.insert(index);
        self.order_nodes();
    }

    pub fn remove_automatic_pull_node(&mut self, index: NodeIndex) {
        self.automatic_pull.remove(&index);
        self.order_nodes();
    }

    pub fn children(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.edges
            .iter()
            .filter(move |&(_s, d)| d.0 == node)
            .map(|&(s, _d)| s.0)
    }

    fn visit(&self, n: NodeIndex, marked: &mut Vec<NodeIndex>, ordered: &mut Vec<NodeIndex>) {
        if marked.contains(&n) {
            return;
        }
        marked.push(n);
        self.children(n)
            .for_each(|c| self.visit(c, marked, ordered));
        ordered.insert(0, n);
    }

    /// Recompute the processing order: a depth-first walk from the
    /// destination and every automatic-pull node, upstream sources first.
    ///
    /// Every node appears at most once, which is what makes the ordered walk
    /// a memoized pull: fan-out consumers read the producer's cached output.
    fn order_nodes(&mut self) {
        // take the scratch vectors out of self so the walk can borrow self;
        // the resize keeps their capacity at node-count scale
        let mut ordered = std::mem::replace(&mut self.ordered, vec![]);
        ordered.resize(self.nodes.len(), NodeIndex(0));
        ordered.clear();

        let mut marked = std::mem::replace(&mut self.marked, vec![]);
        marked.resize(self.nodes.len(), NodeIndex(0));
        marked.clear();

        // the destination is the primary root
        let start = NodeIndex(0);
        self.visit(start, &mut marked, &mut ordered);

        // inspector nodes are additional roots
        for &pull in self.automatic_pull.iter() {
            self.visit(pull, &mut marked, &mut ordered);
        }

        ordered.reverse();

        // hand the scratch vectors back for the next recompute
        self.ordered = ordered;
        self.marked = marked;
    }

    /// Render one quantum and return the destination's output bus.
    pub fn render(&mut self, timestamp: f64, sample_rate: SampleRate) -> &AudioBus {
        let quantum_duration = RENDER_QUANTUM_SIZE as f64 / sample_rate.0 as f64;

        // split borrows
        let ordered = &self.ordered;
        let edges = &self.edges;
        let nodes = &mut self.nodes;

        ordered.iter().for_each(|index| {
            // lift the node out of the map while it renders, so its inputs
            // can read sibling buffers from the same map
            let mut node = match nodes.remove(index) {
                Some(node) => node,
                None => return, // edge to a node that has not registered yet
            };

            let count_mode = node.channel_config.count_mode();
            let interpretation = node.channel_config.interpretation();
            let channel_count = node.channel_config.count();

            // mix all connections of each summing junction
            node.input_buses
                .iter_mut()
                .enumerate()
                .for_each(|(port, input_bus)| {
                    let connections = || {
                        edges.iter().filter(|&&(_s, d)| {
                            d.0 == *index && d.1 == port as u32
                        })
                    };

                    // channel count negotiation
                    let mut max_channels = 1;
                    for &((source, output), _) in connections() {
                        if let Some(source_node) = nodes.get(&source) {
                            max_channels = max_channels
                                .max(source_node.buffers[output as usize].number_of_channels());
                        }
                    }
                    let computed_channels = match count_mode {
                        ChannelCountMode::Max => max_channels,
                        ChannelCountMode::ClampedMax => max_channels.min(channel_count),
                        ChannelCountMode::Explicit => channel_count,
                    };

                    input_bus.make_silent();
                    input_bus.set_number_of_channels(computed_channels);

                    // unity-gain sum; a severed or unregistered source is
                    // simply absent and treated as silence
                    for &((source, output), _) in connections() {
                        if let Some(source_node) = nodes.get(&source) {
                            input_bus.sum_from(
                                &source_node.buffers[output as usize],
                                interpretation,
                            );
                        }
                    }
                });

            let inputs_silent = node.input_buses.iter().all(|bus| bus.is_silent());

            let Node {
                processor,
                buffers,
                input_buses,
                last_non_silent_time,
                ..
            } = &mut node;

            if inputs_silent && processor.propagates_silence(timestamp, *last_non_silent_time) {
                buffers.iter_mut().for_each(|bus| bus.make_silent());
            } else {
                let params = AudioParamValues::from(nodes);
                processor.process(input_buses, buffers, params, timestamp, sample_rate);

                if buffers.iter().any(|bus| !bus.is_silent()) {
                    *last_non_silent_time = timestamp + quantum_duration;
                }
            }

            nodes.insert(*index, node);
        });

        // the destination's output is the quantum's result
        &self.nodes.get(&NodeIndex(0)).unwrap().buffers[0]
    }

    fn has_outgoing_edges(&self, index: NodeIndex) -> bool {
        self.edges.iter().any(|&(s, _d)| s.0 == index)
    }

    /// Post-render bookkeeping: disconnect finished sources whose handle was
    /// dropped, then release handle-dropped nodes with no consumers left.
    /// Freed nodes are shipped to the control thread for deallocation.
    pub fn collect_finished(&mut self, reclaim: &Sender<Node>) {
        let mut changed = false;

        // sources that played to completion lose their edges
        let finished: Vec<NodeIndex> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.free_when_finished && node.processor.finished())
            .filter(|(index, _)| {
                self.edges
                    .iter()
                    .any(|&(s, d)| s.0 == **index || d.0 == **index)
            })
            .map(|(&index, _)| index)
            .collect();
        for index in finished {
            self.edges.retain(|&(s, d)| s.0 != index && d.0 != index);
            changed = true;
        }

        // a node lives while something consumes its output
        let to_free: Vec<NodeIndex> = self
            .nodes
            .iter()
            .filter(|(index, node)| node.free_when_finished && !self.has_outgoing_edges(**index))
            .map(|(&index, _)| index)
            .collect();

        for index in to_free {
            self.edges.retain(|&(s, d)| s.0 != index && d.0 != index);
            self.automatic_pull.remove(&index);
            let node = self.nodes.remove(&index).unwrap();

            // deallocation happens on the control thread; if the context is
            // already gone, dropping here is the only option left
            let _ = reclaim.send(node);
            changed = true;
        }

        if changed {
            self.order_nodes();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChannelConfigOptions;

    #[derive(Debug, Clone)]
    struct TestNode {}

    impl AudioProcessor for TestNode {
        fn process(
            &mut self,
            _inputs: &[AudioBus],
            _outputs: &mut [AudioBus],
            _params: AudioParamValues,
            _timestamp: f64,
            _sample_rate: SampleRate,
        ) {
        }
    }

    fn config() -> ChannelConfig {
        ChannelConfigOptions {
            count: 2,
            mode: ChannelCountMode::Explicit,
            interpretation: crate::buffer::ChannelInterpretation::Speakers,
        }
        .into()
    }

    fn position(graph: &Graph, node: u64) -> usize {
        graph
            .ordered
            .iter()
            .position(|&index| index == NodeIndex(node))
            .unwrap()
    }

    #[test]
    fn test_add_remove() {
        let mut graph = Graph::new();
        graph.add_node(NodeIndex(0), Box::new(TestNode {}), 1, 1, config());
        graph.add_node(NodeIndex(1), Box::new(TestNode {}), 1, 1, config());
        graph.add_node(NodeIndex(2), Box::new(TestNode {}), 1, 1, config());
        graph.add_node(NodeIndex(3), Box::new(TestNode {}), 1, 1, config());

        graph.add_edge((NodeIndex(1), 0), (NodeIndex(0), 0));
        graph.add_edge((NodeIndex(2), 0), (NodeIndex(1), 0));
        graph.add_edge((NodeIndex(3), 0), (NodeIndex(0), 0));

        // each reachable node appears exactly once, upstream first
        assert_eq!(graph.ordered.len(), 4);
        assert!(position(&graph, 2) < position(&graph, 1));
        assert!(position(&graph, 1) < position(&graph, 0));
        assert!(position(&graph, 3) < position(&graph, 0));

        graph.remove_edge(NodeIndex(1), NodeIndex(0));

        // nodes 1 and 2 are no longer reachable from the destination
        assert_eq!(graph.ordered.len(), 2);
        assert!(position(&graph, 3) < position(&graph, 0));
    }

    #[test]
    fn test_remove_all() {
        let mut graph = Graph::new();
        graph.add_node(NodeIndex(0), Box::new(TestNode {}), 1, 1, config());
        graph.add_node(NodeIndex(1), Box::new(TestNode {}), 1, 1, config());
        graph.add_node(NodeIndex(2), Box::new(TestNode {}), 1, 1, config());

        graph.add_edge((NodeIndex(1), 0), (NodeIndex(0), 0));
        graph.add_edge((NodeIndex(2), 0), (NodeIndex(0), 0));
        graph.add_edge((NodeIndex(2), 0), (NodeIndex(1), 0));

        assert_eq!(graph.ordered.len(), 3);
        assert!(position(&graph, 2) < position(&graph, 1));
        assert!(position(&graph, 1) < position(&graph, 0));

        graph.remove_edges_from(NodeIndex(2));

        assert_eq!(graph.ordered.len(), 2);
        assert!(position(&graph, 1) < position(&graph, 0));
    }

    #[test]
    fn test_connection_order_is_commutative() {
        let build = |edges: &[((u64, u32), (u64, u32))]| {
            let mut graph = Graph::new();
            for id in 0..3 {
                graph.add_node(NodeIndex(id), Box::new(TestNode {}), 1, 1, config());
            }
            for &((s, so), (d, di)) in edges {
                graph.add_edge((NodeIndex(s), so), (NodeIndex(d), di));
            }
            graph
        };

        // a -> b then b -> c versus b -> c then a -> b
        let g1 = build(&[((2, 0), (1, 0)), ((1, 0), (0, 0))]);
        let g2 = build(&[((1, 0), (0, 0)), ((2, 0), (1, 0))]);

        assert_eq!(g1.edges, g2.edges);
        assert_eq!(g1.ordered, g2.ordered);
    }

    #[test]
    fn test_automatic_pull_nodes_are_rendered() {
        let mut graph = Graph::new();
        graph.add_node(NodeIndex(0), Box::new(TestNode {}), 1, 1, config());
        graph.add_node(NodeIndex(1), Box::new(TestNode {}), 1, 1, config());
        graph.add_node(NodeIndex(2), Box::new(TestNode {}), 1, 1, config());

        // node 2 feeds the inspector node 1, which has no consumers
        graph.add_edge((NodeIndex(2), 0), (NodeIndex(1), 0));
        assert_eq!(graph.ordered.len(), 1);

        graph.add_automatic_pull_node(NodeIndex(1));
        assert_eq!(graph.ordered.len(), 3);
        assert!(position(&graph, 2) < position(&graph, 1));

        graph.remove_automatic_pull_node(NodeIndex(1));
        assert_eq!(graph.ordered.len(), 1);
    }

    #[derive(Debug)]
    struct DcSource {}

    impl AudioProcessor for DcSource {
        fn process(
            &mut self,
            _inputs: &[AudioBus],
            outputs: &mut [AudioBus],
            _params: AudioParamValues,
            _timestamp: f64,
            _sample_rate: SampleRate,
        ) {
            outputs[0].force_mono();
            outputs[0]
                .channel_data_mut(0)
                .as_mut_slice()
                .iter_mut()
                .for_each(|s| *s = 1.);
        }

        fn propagates_silence(&self, _now: f64, _last_non_silent: f64) -> bool {
            false
        }
    }

    struct CountingPassThrough {
        count: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl AudioProcessor for CountingPassThrough {
        fn process(
            &mut self,
            inputs: &[AudioBus],
            outputs: &mut [AudioBus],
            _params: AudioParamValues,
            _timestamp: f64,
            _sample_rate: SampleRate,
        ) {
            self.count.fetch_add(1, Ordering::SeqCst);
            outputs[0].copy_from(&inputs[0]);
        }

        fn propagates_silence(&self, _now: f64, _last_non_silent: f64) -> bool {
            false
        }
    }

    #[test]
    fn test_disconnect_mid_render_silences_input() {
        let (reclaim, _reclaimed) = crossbeam_channel::unbounded();

        let mut graph = Graph::new();
        graph.add_node(
            NodeIndex(0),
            Box::new(CountingPassThrough {
                count: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            }),
            1,
            1,
            config(),
        );
        graph.add_node(NodeIndex(1), Box::new(DcSource {}), 0, 1, config());
        graph.add_edge((NodeIndex(1), 0), (NodeIndex(0), 0));

        let sample_rate = SampleRate(44_100);
        let first = graph.render(0., sample_rate).channel_data(0).as_slice()[0];
        assert_eq!(first, 1.);

        // sever the connection between quanta: the very next quantum the
        // junction sums to silence
        graph.remove_edge(NodeIndex(1), NodeIndex(0));
        graph.collect_finished(&reclaim);

        let second = graph.render(1., sample_rate).channel_data(0).as_slice()[0];
        assert_eq!(second, 0.);
    }

    #[test]
    fn test_each_node_processes_once_per_quantum() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut graph = Graph::new();
        // destination with two inputs, both fed by the same counting node
        graph.add_node(NodeIndex(0), Box::new(TestNode {}), 2, 1, config());
        graph.add_node(
            NodeIndex(1),
            Box::new(CountingPassThrough {
                count: count.clone(),
            }),
            1,
            1,
            config(),
        );
        graph.add_node(NodeIndex(2), Box::new(DcSource {}), 0, 1, config());

        graph.add_edge((NodeIndex(2), 0), (NodeIndex(1), 0));
        graph.add_edge((NodeIndex(1), 0), (NodeIndex(0), 0));
        graph.add_edge((NodeIndex(1), 0), (NodeIndex(0), 1));

        // fan-out of two does not double-process the producer
        graph.render(0., SampleRate(44_100));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        graph.render(1., SampleRate(44_100));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_collect_finished_frees_unconsumed_nodes() {
        let (reclaim, reclaimed) = crossbeam_channel::unbounded();

        let mut graph = Graph::new();
        graph.add_node(NodeIndex(0), Box::new(TestNode {}), 1, 1, config());
        graph.add_node(NodeIndex(1), Box::new(TestNode {}), 1, 1, config());
        graph.add_edge((NodeIndex(1), 0), (NodeIndex(0), 0));

        // handle dropped, but still connected: stays alive
        graph.mark_free_when_finished(NodeIndex(1));
        graph.collect_finished(&reclaim);
        assert!(graph.nodes.contains_key(&NodeIndex(1)));

        // disconnected: reclaimed
        graph.remove_edge(NodeIndex(1), NodeIndex(0));
        graph.collect_finished(&reclaim);
        assert!(!graph.nodes.contains_key(&NodeIndex(1)));
        assert_eq!(reclaimed.try_iter().count(), 1);
    }
}
