use flowcore::{NodeId, Wires};

/// One resolved dispatch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub node_id: NodeId,
    /// Nodes have a single input; kept for symmetry with output ports.
    pub port: usize,
}

/// Per-output-port ordered list of targets for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchTable {
    ports: Vec<Vec<Target>>,
}

impl DispatchTable {
    pub fn from_wires(wires: &[Vec<NodeId>]) -> Self {
        let ports = wires
            .iter()
            .map(|port| {
                port.iter()
                    .map(|id| Target {
                        node_id: id.clone(),
                        port: 0,
                    })
                    .collect()
            })
            .collect();
        Self { ports }
    }

    /// Targets of `port`, in wiring order. Unknown ports have none.
    pub fn targets(&self, port: usize) -> &[Target] {
        self.ports.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.iter().all(Vec::is_empty)
    }

    pub fn to_wires(&self) -> Wires {
        self.ports
            .iter()
            .map(|port| port.iter().map(|t| t.node_id.clone()).collect())
            .collect()
    }
}
