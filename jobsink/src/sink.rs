//! Destino de escritura que coordina el ciclo de vida de un job remoto.
//!
//! Todo el estado (contadores, flags, cola de claves pendientes) vive en una
//! única tarea (`SinkActor`). Los handles `JobSink` le mandan `Request`s y las
//! llamadas remotas, que corren en tareas aparte, le devuelven `Event`s; así
//! ninguna mutación compite con otra.
//!
//! Etapas: no-job -> awaiting-gate -> creating -> open -> ended -> terminal.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::{
    JobDescriptor, JobId, JobInfo, JobKey, PhaseKind, Step, StepError, UnixTool,
};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{KeyFailurePolicy, SinkConfig, UploadPreparerConfig};
use crate::error::SinkError;
use crate::gate::{PackageGate, PackageKey, PackagePreparer, PackageSpec, PackageStep, UploadPreparer};
use crate::remote::JobService;

type Reply<T> = oneshot::Sender<Result<T, SinkError>>;

/// Piso del intervalo de polling; un intervalo cero no es un tick válido.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStage {
    NoJob,
    AwaitingGate,
    Creating,
    Open,
    Ended,
    Terminal,
}

/// Foto de los contadores del sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSnapshot {
    pub stage: SinkStage,
    pub job_id: Option<JobId>,
    pub incoming: u64,
    pub submitted: u64,
    pub pending: usize,
    pub outstanding_packages: usize,
    pub input_ended: bool,
    pub end_issued: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub written: u64,
    pub failed: u64,
}

impl FeedSummary {
    fn absorb(&mut self, done: Result<Result<(), SinkError>, JoinError>) -> Result<(), SinkError> {
        match done {
            Ok(Ok(())) => self.written += 1,
            Ok(Err(e)) if e.is_fatal() => return Err(e),
            Ok(Err(_)) => self.failed += 1,
            Err(e) => {
                error!("tarea de escritura abortada: {:?}", e);
                return Err(SinkError::Closed);
            }
        }
        Ok(())
    }
}

enum Observer {
    Callback(Box<dyn FnOnce(&JobInfo) + Send>),
    Waiter(oneshot::Sender<Result<JobInfo, SinkError>>),
}

impl Observer {
    fn notify(self, outcome: &Result<JobInfo, SinkError>) {
        match self {
            Observer::Callback(f) => {
                if let Ok(info) = outcome {
                    f(info);
                }
            }
            Observer::Waiter(tx) => {
                let _ = tx.send(outcome.clone());
            }
        }
    }
}

/* ---------------- mensajes del actor ---------------- */

enum Request {
    DeclarePhase {
        kind: PhaseKind,
        step: Step,
        reply: Reply<()>,
    },
    AddDestination {
        dest: String,
        reply: Reply<()>,
    },
    RequestPackage {
        package: PackageSpec,
        reply: Reply<PackageStep>,
    },
    Write {
        key: JobKey,
        reply: Reply<()>,
    },
    EndInput {
        reply: Reply<()>,
    },
    Observe(Observer),
    Snapshot(oneshot::Sender<SinkSnapshot>),
}

enum Event {
    PackagePrepared {
        key: PackageKey,
        result: Result<(), String>,
    },
    JobCreated(Result<JobId, String>),
    KeySubmitted {
        key: JobKey,
        result: Result<(), String>,
        reply: Reply<()>,
    },
    InputClosed(Result<(), String>),
    JobDone(JobInfo),
}

/* ---------------- handle público ---------------- */

/// Handle clonable hacia el sink. Necesita un runtime de tokio.
#[derive(Clone)]
pub struct JobSink {
    tx: mpsc::UnboundedSender<Request>,
}

impl JobSink {
    /// Sink cuyos paquetes se suben al object store del mismo servicio.
    pub fn new(config: SinkConfig, service: Arc<dyn JobService>) -> Self {
        let preparer = Arc::new(UploadPreparer::new(
            Arc::clone(&service),
            UploadPreparerConfig::default(),
        ));
        Self::with_preparer(config, service, preparer)
    }

    pub fn with_preparer(
        config: SinkConfig,
        service: Arc<dyn JobService>,
        preparer: Arc<dyn PackagePreparer>,
    ) -> Self {
        let (tx, requests) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let span = info_span!("job_sink", name = %config.name);
        let actor = SinkActor::new(config, service, PackageGate::new(preparer), events_tx);
        tokio::spawn(actor.run(requests, events).instrument(span));

        Self { tx }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, SinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)?
    }

    pub async fn declare_map_phase(&self, step: Step) -> Result<(), SinkError> {
        self.call(|reply| Request::DeclarePhase {
            kind: PhaseKind::Map,
            step,
            reply,
        })
        .await
    }

    pub async fn declare_reduce_phase(&self, step: Step) -> Result<(), SinkError> {
        self.call(|reply| Request::DeclarePhase {
            kind: PhaseKind::Reduce,
            step,
            reply,
        })
        .await
    }

    /// Destino final: se compila como una fase reduce extra al crear el job.
    pub async fn add_terminal_destination(&self, dest: impl Into<String>) -> Result<(), SinkError> {
        let dest = dest.into();
        self.call(|reply| Request::AddDestination { dest, reply }).await
    }

    pub async fn request_package(&self, package: PackageSpec) -> Result<PackageStep, SinkError> {
        self.call(|reply| Request::RequestPackage { package, reply })
            .await
    }

    /// Escribe una clave. Resuelve cuando se sabe si el servicio remoto la
    /// aceptó, no cuando queda en cola.
    pub async fn write(&self, key: impl Into<JobKey>) -> Result<(), SinkError> {
        let key = key.into();
        self.call(|reply| Request::Write { key, reply }).await
    }

    /// Marca el fin de la entrada. Llamarlo dos veces es un error.
    pub async fn notify_input_ended(&self) -> Result<(), SinkError> {
        self.call(|reply| Request::EndInput { reply }).await
    }

    /// Callback de una sola vez con el job final, solo si termina bien.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&JobInfo) + Send + 'static,
    {
        if self
            .tx
            .send(Request::Observe(Observer::Callback(Box::new(f))))
            .is_err()
        {
            warn!("on_complete registrado sobre un sink ya detenido");
        }
    }

    /// Espera al estado terminal: el job final o el error que tumbó el sink.
    pub async fn wait(&self) -> Result<JobInfo, SinkError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Observe(Observer::Waiter(tx)))
            .map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<SinkSnapshot, SinkError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Snapshot(tx))
            .map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)
    }

    /// Escribe todas las claves del canal con hasta `concurrency` envíos en
    /// vuelo y después cierra la entrada.
    pub async fn feed(
        &self,
        mut keys: mpsc::Receiver<JobKey>,
        concurrency: usize,
    ) -> Result<FeedSummary, SinkError> {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut summary = FeedSummary::default();

        while let Some(key) = keys.recv().await {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|_| SinkError::Closed)?;
            let sink = self.clone();
            tasks.spawn(async move {
                let result = sink.write(key).await;
                drop(permit);
                result
            });

            while let Some(done) = tasks.try_join_next() {
                summary.absorb(done)?;
            }
        }

        while let Some(done) = tasks.join_next().await {
            summary.absorb(done)?;
        }

        self.notify_input_ended().await?;
        Ok(summary)
    }
}

/* ---------------- actor ---------------- */

struct SinkActor {
    config: SinkConfig,
    service: Arc<dyn JobService>,
    gate: PackageGate,
    events: mpsc::UnboundedSender<Event>,

    phases: Vec<(PhaseKind, Step)>,
    destinations: Vec<String>,

    stage: SinkStage,
    job_id: Option<JobId>,
    incoming: u64,
    submitted: u64,
    pending: VecDeque<(JobKey, Reply<()>)>,
    input_ended: bool,
    end_issued: bool,

    observers: Vec<Observer>,
    outcome: Option<Result<JobInfo, SinkError>>,
    poller: Option<JoinHandle<()>>,
    closed: bool,
}

impl SinkActor {
    fn new(
        config: SinkConfig,
        service: Arc<dyn JobService>,
        gate: PackageGate,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            service,
            gate,
            events,
            phases: Vec::new(),
            destinations: Vec::new(),
            stage: SinkStage::NoJob,
            job_id: None,
            incoming: 0,
            submitted: 0,
            pending: VecDeque::new(),
            input_ended: false,
            end_issued: false,
            observers: Vec::new(),
            outcome: None,
            poller: None,
            closed: false,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut detached = false;

        loop {
            tokio::select! {
                req = requests.recv(), if !detached => match req {
                    Some(req) => self.handle_request(req),
                    None => {
                        detached = true;
                        self.on_detached();
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }

            if detached && self.stage == SinkStage::Terminal {
                break;
            }
        }

        debug!("sink detenido");
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::DeclarePhase { kind, step, reply } => {
                let _ = reply.send(self.declare_phase(kind, step));
            }
            Request::AddDestination { dest, reply } => {
                let _ = reply.send(self.add_destination(dest));
            }
            Request::RequestPackage { package, reply } => {
                let _ = reply.send(self.request_package(package));
            }
            Request::Write { key, reply } => self.write(key, reply),
            Request::EndInput { reply } => self.end_input(reply),
            Request::Observe(observer) => self.observe(observer),
            Request::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::PackagePrepared { key, result } => self.package_prepared(key, result),
            Event::JobCreated(result) => self.job_created(result),
            Event::KeySubmitted { key, result, reply } => self.key_submitted(key, result, reply),
            Event::InputClosed(result) => self.input_closed(result),
            Event::JobDone(info) => self.job_done(info),
        }
    }

    /// Lanza una operación remota; su resultado vuelve como evento.
    fn spawn_event<F>(&self, fut: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(
            async move {
                let _ = events.send(fut.await);
            }
            .in_current_span(),
        );
    }

    /* -------- definición del job -------- */

    fn definitions_open(&self) -> Result<(), SinkError> {
        match self.stage {
            SinkStage::NoJob | SinkStage::AwaitingGate => Ok(()),
            SinkStage::Terminal => Err(self.failure()),
            _ => Err(SinkError::JobAlreadyCreated),
        }
    }

    fn declare_phase(&mut self, kind: PhaseKind, step: Step) -> Result<(), SinkError> {
        self.definitions_open()?;
        // una cadena sin resolver falla ahora, no al crear el job
        step.compile_phase_with_image(kind, &self.config.image)?;
        debug!("fase {} declarada (#{})", kind, self.phases.len() + 1);
        self.phases.push((kind, step));
        Ok(())
    }

    fn add_destination(&mut self, dest: String) -> Result<(), SinkError> {
        self.definitions_open()?;
        debug!("destino final {}", dest);
        self.destinations.push(dest);
        Ok(())
    }

    fn request_package(&mut self, package: PackageSpec) -> Result<PackageStep, SinkError> {
        self.definitions_open()?;
        let request = self.gate.request(package);

        if let Some((package, target)) = request.start {
            let preparer = self.gate.preparer();
            self.spawn_event(async move {
                let result = preparer
                    .prepare(&package, &target)
                    .await
                    .map_err(|e| e.to_string());
                Event::PackagePrepared {
                    key: package.key(),
                    result,
                }
            });
        }

        Ok(request.step)
    }

    fn package_prepared(&mut self, key: PackageKey, result: Result<(), String>) {
        let open = self.gate.complete(&key, result);
        if let Some(reason) = self.gate.failure() {
            let err = SinkError::PackagePreparation(reason.to_string());
            self.fail(err);
            return;
        }

        debug!(
            "paquete {}@{} listo ({} pendientes)",
            key.name,
            key.version,
            self.gate.outstanding()
        );
        if open && self.stage == SinkStage::AwaitingGate {
            self.create_job();
        }
        self.check_end();
    }

    /// Fases declaradas y, al final, una fase reduce por cada destino.
    fn compile(&self) -> Result<JobDescriptor, StepError> {
        let image = &self.config.image;
        let mut phases = self
            .phases
            .iter()
            .map(|(kind, step)| step.compile_phase_with_image(*kind, image))
            .collect::<Result<Vec<_>, _>>()?;

        let pipe = UnixTool::new(&self.config.pipe_tool);
        for dest in &self.destinations {
            phases.push(pipe.step([dest]).compile_phase_with_image(PhaseKind::Reduce, image)?);
        }

        Ok(JobDescriptor {
            name: self.config.name.clone(),
            phases,
        })
    }

    /* -------- creación -------- */

    fn ensure_job(&mut self) {
        if self.stage != SinkStage::NoJob {
            return;
        }

        if self.gate.outstanding() > 0 {
            info!(
                "esperando {} paquetes antes de crear el job",
                self.gate.outstanding()
            );
            self.stage = SinkStage::AwaitingGate;
        } else {
            self.create_job();
        }
    }

    fn create_job(&mut self) {
        self.stage = SinkStage::Creating;

        let descriptor = match self.compile() {
            Ok(d) => d,
            Err(e) => {
                self.fail(SinkError::Step(e));
                return;
            }
        };

        info!(
            "creando job {} ({} fases, {} claves en espera)",
            descriptor.name,
            descriptor.phases.len(),
            self.pending.len()
        );

        let service = Arc::clone(&self.service);
        self.spawn_event(async move {
            let result = service
                .create_job(&descriptor)
                .await
                .map_err(|e| e.to_string());
            Event::JobCreated(result)
        });
    }

    fn job_created(&mut self, result: Result<JobId, String>) {
        if self.stage != SinkStage::Creating {
            return;
        }

        match result {
            Ok(job_id) => {
                info!("job {} creado, enviando {} claves", job_id, self.pending.len());
                self.job_id = Some(job_id.clone());
                self.stage = SinkStage::Open;

                while let Some((key, reply)) = self.pending.pop_front() {
                    self.submit(job_id.clone(), key, reply);
                }
                self.check_end();
            }
            Err(reason) => {
                error!("no se pudo crear el job: {}", reason);
                self.fail(SinkError::JobCreationFailed(reason));
            }
        }
    }

    /* -------- claves -------- */

    fn write(&mut self, key: JobKey, reply: Reply<()>) {
        if self.stage == SinkStage::Terminal {
            let _ = reply.send(Err(self.failure()));
            return;
        }
        if self.input_ended {
            let _ = reply.send(Err(SinkError::InputEnded));
            return;
        }

        self.incoming += 1;
        debug!("agregando clave {} ({} recibidas)", key, self.incoming);

        match self.job_id.clone() {
            Some(job_id) => self.submit(job_id, key, reply),
            None => {
                self.pending.push_back((key, reply));
                self.ensure_job();
            }
        }
    }

    fn submit(&self, job_id: JobId, key: JobKey, reply: Reply<()>) {
        let service = Arc::clone(&self.service);
        self.spawn_event(async move {
            let result = service
                .add_job_key(&job_id, &key)
                .await
                .map_err(|e| e.to_string());
            Event::KeySubmitted { key, result, reply }
        });
    }

    fn key_submitted(&mut self, key: JobKey, result: Result<(), String>, reply: Reply<()>) {
        self.submitted += 1;

        match result {
            Ok(()) => {
                debug!("clave {} agregada ({}/{})", key, self.submitted, self.incoming);
                let _ = reply.send(Ok(()));
            }
            Err(reason) => {
                error!("no se pudo agregar la clave {}: {}", key, reason);
                let err = SinkError::KeySubmission {
                    key: key.to_string(),
                    reason,
                };
                let _ = reply.send(Err(err.clone()));

                if self.config.key_failure_policy == KeyFailurePolicy::Abort {
                    self.fail(SinkError::Aborted(err.to_string()));
                }
            }
        }

        self.check_end();
    }

    /* -------- fin de entrada -------- */

    fn end_input(&mut self, reply: Reply<()>) {
        // en un sink fallido siempre se devuelve la falla, incluso en la segunda llamada
        if self.stage == SinkStage::Terminal {
            self.input_ended = true;
            let _ = reply.send(Err(self.failure()));
            return;
        }
        if self.input_ended {
            let _ = reply.send(Err(SinkError::DoubleEnd));
            return;
        }
        self.input_ended = true;
        let _ = reply.send(Ok(()));
        debug!("fin de entrada ({} claves recibidas)", self.incoming);

        // sin claves no hubo motivo para crear el job; se crea igual para cerrarlo
        if self.incoming == 0 {
            self.ensure_job();
        }
        self.check_end();
    }

    /// Se evalúa después de cada evento que pueda igualar los contadores.
    fn check_end(&mut self) {
        if self.stage != SinkStage::Open
            || !self.input_ended
            || self.end_issued
            || self.incoming != self.submitted
        {
            return;
        }
        let Some(job_id) = self.job_id.clone() else {
            return;
        };

        self.end_issued = true;
        self.stage = SinkStage::Ended;
        info!("cerrando entrada del job {} ({} claves)", job_id, self.submitted);

        let service = Arc::clone(&self.service);
        self.spawn_event(async move {
            let result = service
                .end_job_input(&job_id)
                .await
                .map_err(|e| e.to_string());
            Event::InputClosed(result)
        });
    }

    fn input_closed(&mut self, result: Result<(), String>) {
        if self.stage != SinkStage::Ended {
            return;
        }
        match result {
            Ok(()) => {
                debug!("entrada del job cerrada");
                self.start_poller();
            }
            Err(reason) => {
                error!("no se pudo cerrar la entrada: {}", reason);
                self.fail(SinkError::EndInputFailed(reason));
            }
        }
    }

    /* -------- polling y estado terminal -------- */

    fn start_poller(&mut self) {
        let Some(job_id) = self.job_id.clone() else {
            return;
        };
        let service = Arc::clone(&self.service);
        let events = self.events.clone();
        let period = self.config.poll_interval.max(MIN_POLL_INTERVAL);

        let handle = tokio::spawn(
            poll_until_done(service, job_id, period, events).in_current_span(),
        );
        self.poller = Some(handle);
    }

    fn stop_poller(&mut self) {
        if let Some(handle) = self.poller.take() {
            handle.abort();
            debug!("polling cancelado");
        }
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.service.close();
        }
    }

    fn job_done(&mut self, info: JobInfo) {
        if self.stage == SinkStage::Terminal {
            return;
        }
        self.stop_poller();
        self.release();
        self.stage = SinkStage::Terminal;

        info!("job {} terminado ({} claves)", info.id, info.keys);
        self.finish(Ok(info));
    }

    fn fail(&mut self, err: SinkError) {
        if self.stage == SinkStage::Terminal {
            return;
        }
        error!("sink fallido: {}", err);
        self.terminate(err);
    }

    /// Todos los handles se soltaron. Si la entrada no terminó el job nunca
    /// se podrá cerrar, así que se liberan los recursos ya.
    fn on_detached(&mut self) {
        if self.input_ended || self.stage == SinkStage::Terminal {
            return;
        }
        warn!("sink descartado antes de terminar la entrada");
        self.terminate(SinkError::Closed);
    }

    fn terminate(&mut self, err: SinkError) {
        self.stage = SinkStage::Terminal;
        self.stop_poller();
        self.release();

        for (_, reply) in self.pending.drain(..) {
            let _ = reply.send(Err(err.clone()));
        }
        self.finish(Err(err));
    }

    fn finish(&mut self, outcome: Result<JobInfo, SinkError>) {
        for observer in self.observers.drain(..) {
            observer.notify(&outcome);
        }
        self.outcome = Some(outcome);
    }

    fn observe(&mut self, observer: Observer) {
        match &self.outcome {
            Some(outcome) => observer.notify(outcome),
            None => self.observers.push(observer),
        }
    }

    fn failure(&self) -> SinkError {
        match &self.outcome {
            Some(Err(e)) => e.clone(),
            _ => SinkError::Closed,
        }
    }

    fn snapshot(&self) -> SinkSnapshot {
        SinkSnapshot {
            stage: self.stage,
            job_id: self.job_id.clone(),
            incoming: self.incoming,
            submitted: self.submitted,
            pending: self.pending.len(),
            outstanding_packages: self.gate.outstanding(),
            input_ended: self.input_ended,
            end_issued: self.end_issued,
        }
    }
}

impl Drop for SinkActor {
    fn drop(&mut self) {
        self.stop_poller();
        self.release();
    }
}

/// Consulta el estado cada `period` hasta ver `done`. Los errores de consulta
/// no son fatales: se loguean y se reintenta en el siguiente tick.
async fn poll_until_done(
    service: Arc<dyn JobService>,
    job_id: JobId,
    period: Duration,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match service.get_job_status(&job_id).await {
            Ok(info) if info.state.is_terminal() => {
                let _ = events.send(Event::JobDone(info));
                return;
            }
            Ok(info) => debug!("job {} sigue en {:?}", job_id, info.state),
            Err(e) => warn!("error consultando job {}, reintentando: {}", job_id, e),
        }
    }
}
