// ABOUTME: In-memory connection and factory doubles for pool and handle tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::connection::{CloseListener, Connection, ConnectionError, Loader, ServiceObject};
use super::factory::{ConnectionFactory, FactoryError};
use super::protocol::{ObjectRef, LOADER_INTERFACE};

/// Switches shared between a test and one fake connection
#[derive(Debug, Clone)]
pub struct FakeControl {
    pub responsive: Arc<AtomicBool>,
    pub closed: Arc<AtomicBool>,
}

impl Default for FakeControl {
    fn default() -> Self {
        Self {
            responsive: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl FakeControl {
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connection whose health is driven by its [`FakeControl`]
pub struct FakeConnection {
    serial: usize,
    control: FakeControl,
    listener: Mutex<Option<CloseListener>>,
}

impl FakeConnection {
    pub fn new(serial: usize, control: FakeControl) -> Self {
        Self {
            serial,
            control,
            listener: Mutex::new(None),
        }
    }

    fn reference(&self, interface: &str) -> ObjectRef {
        ObjectRef {
            object: format!("fake#{}", self.serial),
            interface: interface.to_string(),
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn service(&self, name: &str) -> Result<ServiceObject, ConnectionError> {
        if self.control.is_closed() {
            return Err(ConnectionError::Closed);
        }
        Ok(ServiceObject {
            name: name.to_string(),
            reference: self.reference(name),
        })
    }

    async fn loader(&self) -> Result<Loader, ConnectionError> {
        if self.control.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if !self.control.responsive.load(Ordering::SeqCst) {
            return Err(ConnectionError::Protocol("unresponsive".to_string()));
        }
        Ok(Loader {
            reference: self.reference(LOADER_INTERFACE),
        })
    }

    fn set_listener(&self, listener: CloseListener) {
        *self.listener.lock() = Some(listener);
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.control.closed.swap(true, Ordering::SeqCst) {
            if let Some(listener) = self.listener.lock().take() {
                listener();
            }
        }
        Ok(())
    }
}

/// Factory handing out [`FakeConnection`]s and recording what happened
#[derive(Default)]
pub struct FakeFactory {
    controls: Mutex<Vec<FakeControl>>,
    destroy_hooks: AtomicUsize,
    fail_creates: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of connections created so far
    pub fn created(&self) -> usize {
        self.controls.lock().len()
    }

    /// Control for the `index`th created connection
    pub fn control(&self, index: usize) -> FakeControl {
        self.controls.lock()[index].clone()
    }

    pub fn destroy_hooks(&self) -> usize {
        self.destroy_hooks.load(Ordering::SeqCst)
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(&self) -> Result<Box<dyn Connection>, FactoryError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(FactoryError::Connection(ConnectionError::Protocol(
                "service down".to_string(),
            )));
        }
        let control = FakeControl::default();
        let mut controls = self.controls.lock();
        let serial = controls.len();
        controls.push(control.clone());
        Ok(Box::new(FakeConnection::new(serial, control)))
    }

    async fn on_destroy(&self) {
        self.destroy_hooks.fetch_add(1, Ordering::SeqCst);
    }
}
