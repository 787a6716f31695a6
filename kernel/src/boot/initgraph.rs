//! Boot-time init graph
//!
//! Subsystems register as named nodes declaring the nodes they depend on;
//! the graph runs every satisfiable node exactly once in topological
//! order. A node whose action fails is logged and skipped together with
//! everything that (transitively) depends on it; the rest of the boot
//! continues.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use super::BootInfo;
use crate::error::KernelResult;

type InitAction = fn(&BootInfo) -> KernelResult<()>;

/// One initialization stage.
pub struct InitNode {
    pub name: &'static str,
    pub deps: &'static [&'static str],
    pub action: InitAction,
}

impl InitNode {
    pub const fn new(name: &'static str, deps: &'static [&'static str], action: InitAction) -> Self {
        Self { name, deps, action }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Done,
    Failed,
}

/// The registry of init stages.
#[cfg(feature = "alloc")]
pub struct InitGraph {
    nodes: Vec<InitNode>,
}

#[cfg(feature = "alloc")]
impl InitGraph {
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn register(&mut self, node: InitNode) {
        self.nodes.push(node);
    }

    /// Run all nodes in dependency order. Returns the names of nodes that
    /// ran successfully, in execution order.
    pub fn execute(&self, boot: &BootInfo) -> Vec<&'static str> {
        let mut state: Vec<NodeState> = self.nodes.iter().map(|_| NodeState::Pending).collect();
        let mut ran = Vec::new();

        // Kahn-style passes: each round runs every node whose deps are all
        // Done. A round without progress means the rest is unsatisfiable
        // (cycle, unknown or failed dependency).
        loop {
            let mut progressed = false;
            for (index, node) in self.nodes.iter().enumerate() {
                if state[index] != NodeState::Pending {
                    continue;
                }
                let mut satisfiable = true;
                let mut satisfied = true;
                for dep in node.deps {
                    match self.lookup(dep).map(|i| state[i]) {
                        Some(NodeState::Done) => {}
                        Some(NodeState::Pending) => satisfied = false,
                        Some(NodeState::Failed) | None => satisfiable = false,
                    }
                }
                if !satisfiable {
                    log::warn!(
                        "init: skipping \"{}\", dependency missing or failed",
                        node.name
                    );
                    state[index] = NodeState::Failed;
                    progressed = true;
                    continue;
                }
                if !satisfied {
                    continue;
                }
                log::debug!("init: reached \"{}\"", node.name);
                match (node.action)(boot) {
                    Ok(()) => {
                        state[index] = NodeState::Done;
                        ran.push(node.name);
                    }
                    Err(err) => {
                        log::error!("init: \"{}\" failed: {}", node.name, err);
                        state[index] = NodeState::Failed;
                    }
                }
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if state[index] == NodeState::Pending {
                log::warn!("init: \"{}\" never became runnable", node.name);
            }
        }
        ran
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }
}

#[cfg(feature = "alloc")]
impl Default for InitGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::boot::{BootInfo, PhysMemory};
    use crate::error::KernelError;
    use crate::mm::{PhysAddr, VirtAddr};

    fn dummy_boot(memory_map: &mut [PhysMemory]) -> BootInfo<'_> {
        BootInfo {
            cmdline: "",
            memory_map,
            kernel_phys: PhysAddr::new(0),
            kernel_virt: VirtAddr::new(0),
            hhdm_offset: 0,
            files: &[],
            rsdp: None,
            fdt: None,
            cpus: &[],
            boot_cpu: 0,
        }
    }

    fn ok(_: &BootInfo) -> crate::error::KernelResult<()> {
        Ok(())
    }

    fn fail(_: &BootInfo) -> crate::error::KernelResult<()> {
        Err(KernelError::NotInitialized { subsystem: "test" })
    }

    #[test]
    fn dependencies_run_first() {
        let mut graph = InitGraph::new();
        graph.register(InitNode::new("late", &["early"], ok));
        graph.register(InitNode::new("early", &[], ok));

        let mut mm: [PhysMemory; 0] = [];
        let ran = graph.execute(&dummy_boot(&mut mm));
        assert_eq!(ran, ["early", "late"]);
    }

    #[test]
    fn failure_skips_dependents_only() {
        let mut graph = InitGraph::new();
        graph.register(InitNode::new("broken", &[], fail));
        graph.register(InitNode::new("victim", &["broken"], ok));
        graph.register(InitNode::new("bystander", &[], ok));

        let mut mm: [PhysMemory; 0] = [];
        let ran = graph.execute(&dummy_boot(&mut mm));
        assert_eq!(ran, ["bystander"]);
    }

    #[test]
    fn unknown_dependency_is_skipped() {
        let mut graph = InitGraph::new();
        graph.register(InitNode::new("orphan", &["nonexistent"], ok));

        let mut mm: [PhysMemory; 0] = [];
        let ran = graph.execute(&dummy_boot(&mut mm));
        assert!(ran.is_empty());
    }

    #[test]
    fn diamond_runs_once_each() {
        let mut graph = InitGraph::new();
        graph.register(InitNode::new("top", &[], ok));
        graph.register(InitNode::new("left", &["top"], ok));
        graph.register(InitNode::new("right", &["top"], ok));
        graph.register(InitNode::new("bottom", &["left", "right"], ok));

        let mut mm: [PhysMemory; 0] = [];
        let ran = graph.execute(&dummy_boot(&mut mm));
        assert_eq!(ran.len(), 4);
        assert_eq!(ran[0], "top");
        assert_eq!(ran[3], "bottom");
    }
}
