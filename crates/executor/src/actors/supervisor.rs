use std::{collections::HashMap, future::Future, time::Duration};
use tracing::{error, info, warn};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use uuid::Uuid;

use common::actors::{Actor, ActorType, ControlMessage};

type ActorFactory = Box<dyn Fn() -> Box<dyn Actor> + Send + Sync>;

struct Running {
    id: Uuid,
    handle: JoinHandle<()>,
    last_pulse: Instant,
}

pub struct Supervisor {
    actor_factories: HashMap<ActorType, ActorFactory>,
    running: HashMap<ActorType, Running>,
    /// Instance id to actor type, so stale heartbeats from a replaced
    /// instance are ignored.
    instances: HashMap<Uuid, ActorType>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat_timeout: Duration,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            actor_factories: HashMap::new(),
            running: HashMap::new(),
            instances: HashMap::new(),
            shutdown_tx,
            heartbeat_timeout: Duration::from_secs(3),
            grace_period: Duration::from_secs(30),
        }
    }

    /// How long shutdown waits for actors before aborting them.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Flips to `true` once shutdown starts. Handed to components that must
    /// stop taking on new work.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn register_actor(&mut self, actor_type: ActorType, factory: ActorFactory) {
        self.actor_factories.insert(actor_type, factory);
    }

    /// Runs until Ctrl-C, then shuts every actor down.
    pub async fn start(&mut self) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;
    }

    pub async fn run_until<F: Future<Output = ()>>(&mut self, stop: F) {
        let mut check_interval = time::interval(Duration::from_secs(1));
        let (supervisor_tx, mut supervisor_rx) = mpsc::channel::<ControlMessage>(512);

        let actors: Vec<ActorType> = self.actor_factories.keys().copied().collect();
        for actor in actors {
            self.spawn_actor(actor, supervisor_tx.clone());
        }

        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("Shutdown requested");
                    break;
                }

                Some(msg) = supervisor_rx.recv() => self.handle_message(msg),

                _ = check_interval.tick() => {
                    let dead_timeout = Instant::now() - self.heartbeat_timeout;

                    let dead_actors: Vec<ActorType> = self
                        .running
                        .iter()
                        .filter(|(_, running)| running.last_pulse < dead_timeout)
                        .map(|(actor_type, _)| *actor_type)
                        .collect();

                    for actor_type in dead_actors {
                        warn!("{:?} is unresponsive! Restarting.", actor_type);
                        if let Some(running) = self.running.remove(&actor_type) {
                            running.handle.abort();
                            self.instances.remove(&running.id);
                        }
                        self.spawn_actor(actor_type, supervisor_tx.clone());
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn handle_message(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Heartbeat(id) => {
                if let Some(running) = self
                    .instances
                    .get(&id)
                    .and_then(|actor_type| self.running.get_mut(actor_type))
                {
                    running.last_pulse = Instant::now();
                }
            }
            ControlMessage::Shutdown(id) => {
                if let Some(actor_type) = self.instances.remove(&id) {
                    warn!("{:?} is shutting down gracefully.", actor_type);
                    self.running.remove(&actor_type);
                }
            }
            ControlMessage::Error(id, error_msg) => match self.instances.get(&id) {
                Some(actor_type) => error!("Actor {:?} reported error: {}", actor_type, error_msg),
                None => error!("Stale actor {} reported error: {}", id, error_msg),
            },
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + self.grace_period;
        for (actor_type, running) in self.running.drain() {
            let mut handle = running.handle;
            match time::timeout_at(deadline, &mut handle).await {
                Ok(_) => info!("{:?} stopped", actor_type),
                Err(_) => {
                    warn!("{:?} did not stop within the grace period, aborting", actor_type);
                    handle.abort();
                }
            }
        }
        self.instances.clear();
    }

    fn spawn_actor(&mut self, actor_type: ActorType, tx: mpsc::Sender<ControlMessage>) {
        let mut new_actor = self.actor_factories[&actor_type]();
        let id = new_actor.id();
        let shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            if let Err(e) = new_actor.run(tx, shutdown).await {
                error!("Actor {:?} crashed: {}", actor_type, e);
            }
        });

        self.instances.insert(id, actor_type);
        self.running.insert(
            actor_type,
            Running {
                id,
                handle,
                last_pulse: Instant::now(),
            },
        );
    }
}
