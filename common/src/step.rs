//! Cadena de pasos de un pipeline de shell.
//!
//! Cada `Step` es un nodo de una lista doblemente enlazada: el sucesor se
//! posee (`Arc`) y el predecesor es solo una referencia débil para recorrer
//! la cadena hacia atrás. Compilar una fase siempre rebobina hasta la cabeza.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use thiserror::Error;

use crate::phase::{PhaseDescriptor, PhaseKind};

/// Imagen de ejecución usada si el caller no indica otra.
pub const DEFAULT_IMAGE: &str = "13.3";

const PIPE_SEPARATOR: &str = " | ";
const INIT_SEPARATOR: &str = " && ";

// Serializa los `link`: chequear y fijar los dos extremos tiene que ser atómico
static LINKING: Mutex<()> = Mutex::new(());

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("step has no command, it must resolve into one before compiling")]
    Unresolved,
    #[error("step is already linked at that position")]
    AlreadyLinked,
    #[error("linking these steps would create a cycle")]
    Cycle,
    #[error("step chain lost a predecessor that is no longer alive")]
    Detached,
}

struct Node {
    command: Option<String>,
    asset: Option<String>,
    init: Option<String>,
    next: OnceLock<Arc<Node>>,
    prev: OnceLock<Weak<Node>>,
}

impl Node {
    fn predecessor(&self) -> Result<Option<Arc<Node>>, StepError> {
        match self.prev.get() {
            None => Ok(None),
            Some(weak) => weak.upgrade().map(Some).ok_or(StepError::Detached),
        }
    }
}

/// Handle a un nodo de la cadena.
///
/// Además del nodo guarda la cabeza de la cadena en el momento en que se
/// obtuvo el handle, así quedarse solo con la cola no libera el resto.
#[derive(Clone)]
pub struct Step {
    node: Arc<Node>,
    anchor: Arc<Node>,
}

impl Step {
    /// Paso sin comando; hay que resolverlo antes de compilar.
    pub fn unresolved() -> Self {
        StepBuilder::default().build()
    }

    pub fn from_command(command: impl Into<String>) -> Self {
        StepBuilder::default().command(command).build()
    }

    pub fn builder() -> StepBuilder {
        StepBuilder::default()
    }

    /// Enlaza varios pasos en orden y devuelve la cola (o None si no hay pasos).
    pub fn chain<I>(steps: I) -> Result<Option<Step>, StepError>
    where
        I: IntoIterator<Item = Step>,
    {
        let mut tail: Option<Step> = None;
        for step in steps {
            tail = Some(match tail {
                None => step,
                Some(prev) => prev.link(&step)?,
            });
        }
        Ok(tail)
    }

    pub fn command(&self) -> Option<&str> {
        self.node.command.as_deref()
    }

    pub fn asset(&self) -> Option<&str> {
        self.node.asset.as_deref()
    }

    pub fn init(&self) -> Option<&str> {
        self.node.init.as_deref()
    }

    pub fn next(&self) -> Option<Step> {
        self.node.next.get().map(|node| Step {
            node: Arc::clone(node),
            anchor: Arc::clone(&self.anchor),
        })
    }

    pub fn previous(&self) -> Option<Step> {
        self.node
            .prev
            .get()
            .and_then(Weak::upgrade)
            .map(|node| Step {
                node,
                anchor: Arc::clone(&self.anchor),
            })
    }

    /// Engancha `next` como sucesor de este paso y devuelve `next` para
    /// poder seguir encadenando.
    pub fn link(&self, next: &Step) -> Result<Step, StepError> {
        let _guard = LINKING.lock().unwrap_or_else(PoisonError::into_inner);

        if self.node.next.get().is_some() || next.node.prev.get().is_some() {
            return Err(StepError::AlreadyLinked);
        }

        // `next` no tiene predecesor, así que solo hay ciclo si es nuestra cabeza
        let head = self.head()?;
        if Arc::ptr_eq(&head, &next.node) {
            return Err(StepError::Cycle);
        }

        self.node
            .next
            .set(Arc::clone(&next.node))
            .map_err(|_| StepError::AlreadyLinked)?;
        next.node
            .prev
            .set(Arc::downgrade(&self.node))
            .map_err(|_| StepError::AlreadyLinked)?;

        Ok(Step {
            node: Arc::clone(&next.node),
            anchor: head,
        })
    }

    /// Comando de shell de este paso.
    pub fn compile_command(&self) -> Result<&str, StepError> {
        match self.node.command.as_deref() {
            Some(cmd) if !cmd.is_empty() => Ok(cmd),
            _ => Err(StepError::Unresolved),
        }
    }

    pub fn compile_phase(&self, kind: PhaseKind) -> Result<PhaseDescriptor, StepError> {
        self.compile_phase_with_image(kind, DEFAULT_IMAGE)
    }

    /// Rebobina hasta la cabeza y recorre la cadena hasta la cola juntando
    /// comandos, assets e inits en orden.
    pub fn compile_phase_with_image(
        &self,
        kind: PhaseKind,
        image: &str,
    ) -> Result<PhaseDescriptor, StepError> {
        let mut commands: Vec<String> = Vec::new();
        let mut assets: Vec<String> = Vec::new();
        let mut inits: Vec<String> = Vec::new();

        let mut cur = Some(self.head()?);
        while let Some(node) = cur {
            let step = Step {
                node: Arc::clone(&node),
                anchor: Arc::clone(&self.anchor),
            };
            commands.push(step.compile_command()?.to_string());

            if let Some(asset) = node.asset.as_deref().filter(|a| !a.is_empty()) {
                assets.push(asset.to_string());
            }
            if let Some(init) = node.init.as_deref().filter(|i| !i.is_empty()) {
                inits.push(init.to_string());
            }

            cur = node.next.get().cloned();
        }

        Ok(PhaseDescriptor {
            kind,
            exec: commands.join(PIPE_SEPARATOR),
            assets,
            init: inits.join(INIT_SEPARATOR),
            image: image.to_string(),
        })
    }

    fn head(&self) -> Result<Arc<Node>, StepError> {
        let mut cur = Arc::clone(&self.node);
        while let Some(prev) = cur.predecessor()? {
            cur = prev;
        }
        Ok(cur)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("command", &self.node.command)
            .field("asset", &self.node.asset)
            .field("init", &self.node.init)
            .field("linked_next", &self.node.next.get().is_some())
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct StepBuilder {
    command: Option<String>,
    asset: Option<String>,
    init: Option<String>,
}

impl StepBuilder {
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn asset(mut self, asset: impl Into<String>) -> Self {
        self.asset = Some(asset.into());
        self
    }

    pub fn init(mut self, init: impl Into<String>) -> Self {
        self.init = Some(init.into());
        self
    }

    pub fn build(self) -> Step {
        let node = Arc::new(Node {
            command: self.command,
            asset: self.asset,
            init: self.init,
            next: OnceLock::new(),
            prev: OnceLock::new(),
        });
        Step {
            anchor: Arc::clone(&node),
            node,
        }
    }
}

/// Fábrica de pasos para una herramienta de línea de comandos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixTool {
    exe: String,
}

impl UnixTool {
    pub fn new(exe: impl Into<String>) -> Self {
        Self { exe: exe.into() }
    }

    pub fn exe(&self) -> &str {
        &self.exe
    }

    /// `exe` seguido de los argumentos separados por un espacio.
    pub fn step<I, S>(&self, args: I) -> Step
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts = vec![self.exe.clone()];
        parts.extend(args.into_iter().map(|a| a.as_ref().to_string()));
        Step::from_command(parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(cmd: &str) -> Step {
        let mut words = cmd.split_whitespace();
        let exe = words.next().unwrap();
        UnixTool::new(exe).step(words)
    }

    #[test]
    fn single_step_compiles_to_one_command() {
        let phase = tool("wc -l").compile_phase(PhaseKind::Reduce).unwrap();

        assert_eq!(phase.kind, PhaseKind::Reduce);
        assert_eq!(phase.exec, "wc -l");
        assert!(phase.assets.is_empty());
        assert_eq!(phase.init, "");
        assert_eq!(phase.image, DEFAULT_IMAGE);
    }

    #[test]
    fn chain_compiles_in_order_from_any_node() {
        let head = tool("cat");
        let middle = head.link(&tool("grep -i error")).unwrap();
        let tail = middle.link(&tool("wc -l")).unwrap();

        for node in [&head, &middle, &tail] {
            let phase = node.compile_phase(PhaseKind::Map).unwrap();
            assert_eq!(phase.exec, "cat | grep -i error | wc -l");
        }
    }

    #[test]
    fn assets_and_inits_follow_chain_order_and_skip_missing() {
        let a = Step::builder()
            .command("node a.js")
            .asset("/acme/a.tgz")
            .init("tar xzf a.tgz")
            .build();
        let b = tool("sort");
        let c = Step::builder()
            .command("node c.js")
            .asset("/acme/c.tgz")
            .init("tar xzf c.tgz")
            .build();
        let d = Step::builder().command("uniq").asset("").init("").build();

        let tail = Step::chain([a, b, c, d]).unwrap().unwrap();
        let phase = tail.compile_phase_with_image(PhaseKind::Map, "15.4").unwrap();

        assert_eq!(phase.exec, "node a.js | sort | node c.js | uniq");
        assert_eq!(phase.assets, vec!["/acme/a.tgz", "/acme/c.tgz"]);
        assert_eq!(phase.init, "tar xzf a.tgz && tar xzf c.tgz");
        assert_eq!(phase.image, "15.4");
    }

    #[test]
    fn duplicate_assets_are_preserved() {
        let a = Step::builder().command("x").asset("/p.tgz").build();
        let b = Step::builder().command("y").asset("/p.tgz").build();
        let tail = Step::chain([a, b]).unwrap().unwrap();

        let phase = tail.compile_phase(PhaseKind::Map).unwrap();
        assert_eq!(phase.assets, vec!["/p.tgz", "/p.tgz"]);
    }

    #[test]
    fn unresolved_step_fails_compilation() {
        let step = Step::unresolved();
        assert_eq!(step.compile_command(), Err(StepError::Unresolved));

        let tail = tool("cat").link(&Step::unresolved()).unwrap();
        assert_eq!(
            tail.compile_phase(PhaseKind::Map),
            Err(StepError::Unresolved)
        );
    }

    #[test]
    fn linking_twice_fails() {
        let a = tool("cat");
        a.link(&tool("sort")).unwrap();
        assert_eq!(a.link(&tool("uniq")).unwrap_err(), StepError::AlreadyLinked);

        // un paso que ya tiene predecesor tampoco se puede reenganchar
        let b = tool("head");
        let c = tool("tail");
        b.link(&c).unwrap();
        assert_eq!(tool("tee").link(&c).unwrap_err(), StepError::AlreadyLinked);
    }

    #[test]
    fn concurrent_links_to_the_same_step_leave_one_winner() {
        use std::sync::Barrier;

        for _ in 0..50 {
            let shared = tool("sort");
            let left = tool("cat");
            let right = tool("zcat");
            let barrier = Barrier::new(2);

            let (l, r) = std::thread::scope(|s| {
                let l = s.spawn(|| {
                    barrier.wait();
                    left.link(&shared).is_ok()
                });
                let r = s.spawn(|| {
                    barrier.wait();
                    right.link(&shared).is_ok()
                });
                (l.join().unwrap(), r.join().unwrap())
            });

            assert!(l ^ r);
            // el perdedor no queda apuntando a un nodo ajeno
            let (winner, loser) = if l { (&left, &right) } else { (&right, &left) };
            assert!(winner.next().is_some());
            assert!(loser.next().is_none());
            assert_eq!(
                shared.previous().unwrap().compile_command().unwrap(),
                winner.compile_command().unwrap()
            );
        }
    }

    #[test]
    fn linking_back_to_head_is_a_cycle() {
        let a = tool("cat");
        let b = a.link(&tool("sort")).unwrap();
        assert_eq!(b.link(&a).unwrap_err(), StepError::Cycle);
        assert!(tool("x").link(&tool("y")).is_ok());

        let lone = tool("uniq");
        assert_eq!(lone.link(&lone).unwrap_err(), StepError::Cycle);
    }

    #[test]
    fn tail_handle_keeps_the_whole_chain_alive() {
        let tail = {
            let head = tool("cat");
            head.link(&tool("sort")).unwrap().link(&tool("uniq")).unwrap()
        };

        let phase = tail.compile_phase(PhaseKind::Map).unwrap();
        assert_eq!(phase.exec, "cat | sort | uniq");
        assert_eq!(tail.previous().unwrap().command(), Some("sort"));
    }

    #[test]
    fn chain_of_nothing_is_none() {
        assert!(Step::chain(Vec::new()).unwrap().is_none());
    }

    #[test]
    fn unix_tool_joins_arguments_with_spaces() {
        let step = UnixTool::new("grep").step(["-i", "error"]);
        assert_eq!(step.compile_command().unwrap(), "grep -i error");

        let bare = UnixTool::new("wc").step(Vec::<String>::new());
        assert_eq!(bare.compile_command().unwrap(), "wc");
    }
}
