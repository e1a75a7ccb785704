//! Session context: one engine, the dispatcher that owns access to it, and
//! the registry of documents open on it.
//!
//! Every engine call made through a [`PdfSession`], [`Document`] or [`Page`]
//! runs as a job on the session's dispatcher, inside a permit of the
//! session's serializing lock. [`PdfSession::exec_direct`] takes the same
//! lock on the caller's thread instead of queueing.
//!
//! Engine closures must not call back into the session: the engine is held
//! for the duration of the closure.

use docpump_dispatch::{
    DispatchError, Dispatcher, DispatcherConfig, JobError, JobHandle, JobOptions, LockError,
    SerializingLock,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    ClipRect, DocumentHandle, EngineError, OpenSource, PageSize, PdfEngine, RenderRequest,
    RgbaImage, Rotation, ThumbnailSize,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("cannot shut down: {0} document(s) still open")]
    DocumentsOpen(usize),
    #[error("document is closed")]
    DocumentClosed,
}

/// Documents currently open in a session, keyed by handle.
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    open: Mutex<BTreeMap<DocumentHandle, String>>,
}

impl DocumentRegistry {
    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }

    pub fn contains(&self, handle: DocumentHandle) -> bool {
        self.open.lock().contains_key(&handle)
    }

    /// Open documents with the source each was loaded from.
    pub fn entries(&self) -> Vec<(DocumentHandle, String)> {
        self.open.lock().iter().map(|(handle, source)| (*handle, source.clone())).collect()
    }

    fn insert(&self, handle: DocumentHandle, source: String) {
        self.open.lock().insert(handle, source);
    }

    fn remove(&self, handle: DocumentHandle) -> bool {
        self.open.lock().remove(&handle).is_some()
    }
}

struct SessionInner<E> {
    engine: Arc<Mutex<E>>,
    dispatcher: Dispatcher,
    lock: Arc<SerializingLock>,
    registry: DocumentRegistry,
}

impl<E: PdfEngine + Send + 'static> SessionInner<E> {
    /// Runs `f` as a job and blocks until it finishes.
    fn exec<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut E) -> Result<T, EngineError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let outcome = self.dispatcher.sync_exec(move || {
            let mut engine = engine.lock();
            f(&mut *engine)
        })?;
        Ok(outcome?)
    }

    fn submit<T, F>(&self, options: JobOptions, f: F) -> JobHandle<Result<T, EngineError>>
    where
        T: Send + 'static,
        F: FnOnce(&mut E) -> Result<T, EngineError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        self.dispatcher.submit(options, move |_| {
            let mut engine = engine.lock();
            f(&mut *engine)
        })
    }
}

/// Explicit owner of one engine instance and its dispatcher.
///
/// # Example
///
/// ```
/// use docpump_dispatch::DispatcherConfig;
/// use docpump_engine::{default_engine, PdfSession};
///
/// let mut session = PdfSession::new(default_engine(), DispatcherConfig::new(1)).unwrap();
/// let document = session.create().unwrap();
///
/// assert_eq!(document.page_count().unwrap(), 0);
/// assert!(session.shutdown().is_err());
///
/// document.close().unwrap();
/// assert!(session.shutdown().unwrap());
/// ```
pub struct PdfSession<E> {
    inner: Arc<SessionInner<E>>,
}

impl<E: PdfEngine + Send + 'static> PdfSession<E> {
    /// Starts a dispatcher for `engine`.
    ///
    /// Jobs run under a serializing lock with one permit per worker thread
    /// and `config.lock_timeout`.
    pub fn new(engine: E, config: DispatcherConfig) -> Result<Self, SessionError> {
        let lock = Arc::new(SerializingLock::with_timeout(
            config.thread_count.max(1),
            config.lock_timeout,
        ));
        let dispatcher = Dispatcher::with_config(config).with_execution_lock(Arc::clone(&lock));
        dispatcher.start()?;
        debug!(threads = dispatcher.thread_count(), "session started");

        Ok(Self {
            inner: Arc::new(SessionInner {
                engine: Arc::new(Mutex::new(engine)),
                dispatcher,
                lock,
                registry: DocumentRegistry::default(),
            }),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.inner.registry
    }

    pub fn lock(&self) -> &Arc<SerializingLock> {
        &self.inner.lock
    }

    pub fn open(&self, source: impl Into<OpenSource>) -> Result<Document<E>, SessionError> {
        let source = source.into();
        let description = source.describe();
        let handle = self.inner.exec(move |engine| engine.open(source))?;
        Ok(self.register(handle, description))
    }

    pub fn create(&self) -> Result<Document<E>, SessionError> {
        let handle = self.inner.exec(|engine| engine.create())?;
        Ok(self.register(handle, "<new>".to_owned()))
    }

    /// Runs an arbitrary engine call as a job and waits for it.
    pub fn exec<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut E) -> Result<T, EngineError> + Send + 'static,
    {
        self.inner.exec(f)
    }

    /// Queues an arbitrary engine call and returns its handle.
    pub fn submit<T, F>(&self, options: JobOptions, f: F) -> JobHandle<Result<T, EngineError>>
    where
        T: Send + 'static,
        F: FnOnce(&mut E) -> Result<T, EngineError> + Send + 'static,
    {
        self.inner.submit(options, f)
    }

    /// Runs `f` on the calling thread while holding a permit of the
    /// session's lock, bypassing the queue.
    pub fn exec_direct<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut E) -> Result<T, EngineError>,
    {
        let run = move || {
            let mut engine = self.inner.engine.lock();
            f(&mut *engine)
        };

        // A worker already holds a permit
        let outcome = if self.inner.dispatcher.is_worker_thread() {
            run()
        } else {
            self.inner.lock.exec(run)?
        };
        Ok(outcome?)
    }

    /// Stops the dispatcher once every document has been closed.
    ///
    /// Returns whether all workers exited within the configured stop timeout.
    pub fn shutdown(&mut self) -> Result<bool, SessionError> {
        let open = self.inner.registry.len();
        if open > 0 {
            return Err(SessionError::DocumentsOpen(open));
        }

        let timeout = self.inner.dispatcher.config().stop_timeout;
        let joined = self.inner.dispatcher.stop(timeout)?;
        debug!(joined, "session shut down");
        Ok(joined)
    }

    fn register(&self, handle: DocumentHandle, source: String) -> Document<E> {
        debug!(%handle, %source, "document registered");
        self.inner.registry.insert(handle, source);
        Document {
            session: Arc::clone(&self.inner),
            state: Arc::new(DocumentState {
                handle,
                closed: AtomicBool::new(false),
                closing: Mutex::new(()),
            }),
        }
    }
}

impl<E> Drop for PdfSession<E> {
    fn drop(&mut self) {
        let dispatcher = &self.inner.dispatcher;
        if !dispatcher.is_running() {
            return;
        }

        let open = self.inner.registry.len();
        if open > 0 {
            warn!(open, "session dropped with documents still open");
        }
        match dispatcher.stop(dispatcher.config().stop_timeout) {
            Ok(true) => {}
            Ok(false) => warn!("session workers did not exit before the stop timeout"),
            Err(err) => warn!(error = %err, "failed to stop session dispatcher"),
        }
    }
}

struct DocumentState {
    handle: DocumentHandle,
    closed: AtomicBool,
    closing: Mutex<()>,
}

impl DocumentState {
    fn ensure_open(&self) -> Result<DocumentHandle, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SessionError::DocumentClosed)
        } else {
            Ok(self.handle)
        }
    }
}

/// An open document. Closed by [`Document::close`] or on drop.
pub struct Document<E: PdfEngine + Send + 'static> {
    session: Arc<SessionInner<E>>,
    state: Arc<DocumentState>,
}

impl<E: PdfEngine + Send + 'static> Document<E> {
    pub fn handle(&self) -> DocumentHandle {
        self.state.handle
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn page_count(&self) -> Result<u32, SessionError> {
        let handle = self.state.ensure_open()?;
        self.session.exec(move |engine| engine.page_count(handle))
    }

    /// Loads page `index` (0-based) and its size.
    pub fn page(&self, index: u32) -> Result<Page<E>, SessionError> {
        let handle = self.state.ensure_open()?;
        let size = self.session.exec(move |engine| engine.page_size(handle, index))?;
        Ok(Page {
            session: Arc::clone(&self.session),
            document: Arc::clone(&self.state),
            index,
            size,
        })
    }

    pub fn pages(&self) -> Result<Vec<Page<E>>, SessionError> {
        (0..self.page_count()?).map(|index| self.page(index)).collect()
    }

    pub fn delete_page(&self, index: u32) -> Result<(), SessionError> {
        let handle = self.state.ensure_open()?;
        self.session.exec(move |engine| engine.delete_page(handle, index))
    }

    pub fn save_to_vec(&self) -> Result<Vec<u8>, SessionError> {
        let handle = self.state.ensure_open()?;
        self.session.exec(move |engine| {
            let mut bytes = Vec::new();
            engine.save_to(handle, &mut bytes)?;
            Ok(bytes)
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let handle = self.state.ensure_open()?;
        let path: PathBuf = path.as_ref().to_path_buf();
        self.session.exec(move |engine| {
            let mut writer = BufWriter::new(File::create(&path)?);
            engine.save_to(handle, &mut writer)?;
            writer.flush()?;
            Ok(())
        })
    }

    /// Releases the document in the engine.
    ///
    /// The document counts as closed only once the engine has released it.
    /// A failed attempt leaves it open and registered so a later call (or
    /// the drop) can retry; after a successful close, calls return `Ok(())`.
    pub fn close(&self) -> Result<(), SessionError> {
        let _closing = self.state.closing.lock();
        if self.state.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let handle = self.state.handle;
        if let Err(err) = self.session.exec(move |engine| engine.close(handle)) {
            debug!(%handle, error = %err, "document close failed");
            return Err(err);
        }

        self.state.closed.store(true, Ordering::Release);
        self.session.registry.remove(handle);
        debug!(%handle, "document closed");
        Ok(())
    }
}

impl<E: PdfEngine + Send + 'static> Drop for Document<E> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(handle = %self.state.handle, error = %err, "failed to close document on drop");
        }
    }
}

/// A page of an open document.
pub struct Page<E> {
    session: Arc<SessionInner<E>>,
    document: Arc<DocumentState>,
    index: u32,
    size: PageSize,
}

impl<E: PdfEngine + Send + 'static> Page<E> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Unrotated size in points, as read when the page was loaded.
    pub fn size(&self) -> PageSize {
        self.size
    }

    pub fn render(&self, scale: f32, clip: Option<ClipRect>) -> Result<RgbaImage, SessionError> {
        let handle = self.document.ensure_open()?;
        let request = RenderRequest {
            page_index: self.index,
            scale,
            clip,
        };
        self.session.exec(move |engine| engine.render_page(handle, request))
    }

    /// Queues a full-page render. Cancelling `options`' token before the job
    /// starts resolves the handle as canceled.
    pub fn submit_render(
        &self,
        scale: f32,
        options: JobOptions,
    ) -> Result<JobHandle<Result<RgbaImage, EngineError>>, SessionError> {
        let handle = self.document.ensure_open()?;
        let request = RenderRequest {
            page_index: self.index,
            scale,
            clip: None,
        };
        Ok(self.session.submit(options, move |engine| engine.render_page(handle, request)))
    }

    pub fn render_thumbnail(&self, target: ThumbnailSize) -> Result<RgbaImage, SessionError> {
        let handle = self.document.ensure_open()?;
        let index = self.index;
        self.session.exec(move |engine| engine.render_thumbnail(handle, index, target))
    }

    pub fn rotation(&self) -> Result<Rotation, SessionError> {
        let handle = self.document.ensure_open()?;
        let index = self.index;
        self.session.exec(move |engine| engine.rotation(handle, index))
    }

    pub fn set_rotation(&self, rotation: Rotation) -> Result<(), SessionError> {
        let handle = self.document.ensure_open()?;
        let index = self.index;
        self.session.exec(move |engine| engine.set_rotation(handle, index, rotation))
    }

    pub fn extract_text(&self) -> Result<String, SessionError> {
        let handle = self.document.ensure_open()?;
        let index = self.index;
        self.session.exec(move |engine| engine.extract_text(handle, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fixtures, LopdfEngine};
    use docpump_dispatch::{CancellationToken, Priority};
    use std::thread;
    use std::time::Duration;

    fn session(threads: usize) -> PdfSession<LopdfEngine> {
        PdfSession::new(LopdfEngine::new(), DispatcherConfig::new(threads)).unwrap()
    }

    fn sample(pages: &[&str]) -> Vec<u8> {
        fixtures::sample_pdf(pages).unwrap()
    }

    #[test]
    fn opens_and_reads_pages() {
        let session = session(1);
        let document = session.open(sample(&["first", "second"])).unwrap();

        assert_eq!(document.page_count().unwrap(), 2);
        let page = document.page(1).unwrap();
        assert_eq!(page.index(), 1);
        assert_eq!(page.size().width_pt, fixtures::PAGE_WIDTH);
        assert!(page.extract_text().unwrap().contains("second"));
        assert_eq!(session.registry().len(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let session = session(1);
        let document = session.open(sample(&["x"])).unwrap();

        document.close().unwrap();
        // A second engine close would fail with InvalidHandle
        document.close().unwrap();

        assert!(document.is_closed());
        assert!(session.registry().is_empty());
        assert_eq!(session.exec(|engine| Ok(engine.open_documents())).unwrap(), 0);
        assert!(matches!(document.page_count(), Err(SessionError::DocumentClosed)));
    }

    #[test]
    fn failed_close_keeps_document_open_for_retry() {
        let config = DispatcherConfig::new(1).with_lock_timeout(Duration::from_millis(20));
        let mut session = PdfSession::new(LopdfEngine::new(), config).unwrap();
        let document = session.open(sample(&["x"])).unwrap();

        let held = session.lock().try_acquire().unwrap();
        assert!(matches!(
            document.close(),
            Err(SessionError::Job(JobError::Lock(LockError::Timeout(_))))
        ));
        drop(held);

        assert!(!document.is_closed());
        assert_eq!(session.registry().len(), 1);
        assert_eq!(document.page_count().unwrap(), 1);
        assert!(matches!(session.shutdown(), Err(SessionError::DocumentsOpen(1))));

        document.close().unwrap();
        assert!(document.is_closed());
        assert!(session.registry().is_empty());
        assert_eq!(session.exec(|engine| Ok(engine.open_documents())).unwrap(), 0);
        assert!(session.shutdown().unwrap());
    }

    #[test]
    fn drop_closes_document() {
        let session = session(1);
        let document = session.open(sample(&["x"])).unwrap();
        let page = document.page(0).unwrap();
        drop(document);

        assert!(session.registry().is_empty());
        assert!(matches!(page.rotation(), Err(SessionError::DocumentClosed)));
    }

    #[test]
    fn shutdown_refuses_while_documents_open() {
        let mut session = session(1);
        let document = session.open(sample(&["x"])).unwrap();

        assert!(matches!(session.shutdown(), Err(SessionError::DocumentsOpen(1))));
        document.close().unwrap();
        assert!(session.shutdown().unwrap());
        assert!(!session.dispatcher().is_running());
    }

    #[test]
    fn engine_errors_pass_through() {
        let session = session(1);

        let encrypted = fixtures::encrypted_marker_pdf().unwrap();
        assert!(matches!(
            session.open(encrypted),
            Err(SessionError::Engine(EngineError::EncryptedUnsupported))
        ));

        let document = session.open(sample(&["x"])).unwrap();
        assert!(matches!(
            document.page(5),
            Err(SessionError::Engine(EngineError::PageOutOfRange {
                page: 5,
                page_count: 1
            }))
        ));
        assert_eq!(session.registry().len(), 1);
    }

    #[test]
    fn edits_survive_save() {
        let session = session(1);
        let document = session.open(sample(&["one", "two"])).unwrap();

        document.page(1).unwrap().set_rotation(Rotation::Clockwise270).unwrap();
        document.delete_page(0).unwrap();
        let bytes = document.save_to_vec().unwrap();

        let reopened = session.open(bytes).unwrap();
        assert_eq!(reopened.page_count().unwrap(), 1);
        assert_eq!(reopened.page(0).unwrap().rotation().unwrap(), Rotation::Clockwise270);
    }

    #[test]
    fn save_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pdf");

        let session = session(1);
        let document = session.create().unwrap();
        assert_eq!(document.page_count().unwrap(), 0);

        let source = session.open(sample(&["body"])).unwrap();
        source.save(&path).unwrap();

        let reopened = session.open(path.as_path()).unwrap();
        assert_eq!(reopened.page_count().unwrap(), 1);
        assert!(session.registry().entries().iter().any(|(_, source)| source.ends_with("out.pdf")));
    }

    #[test]
    fn submitted_render_honours_cancellation() {
        let session = session(1);
        let document = session.open(sample(&["x"])).unwrap();
        let page = document.page(0).unwrap();

        let canceled = page
            .submit_render(1.0, JobOptions::new().with_token(CancellationToken::cancelled()))
            .unwrap();
        assert!(canceled.wait().unwrap_err().is_canceled());

        let rendered = page
            .submit_render(0.5, JobOptions::new().with_priority(Priority::High))
            .unwrap()
            .wait()
            .unwrap()
            .unwrap();
        assert_eq!(rendered.width(), (fixtures::PAGE_WIDTH * 0.5).round() as u32);
    }

    #[test]
    fn exec_direct_shares_the_lock() {
        let session = session(1);
        let document = session.open(sample(&["x"])).unwrap();
        let handle = document.handle();

        let held = session.lock().try_acquire().unwrap();
        assert_eq!(session.lock().available_permits(), 0);
        drop(held);

        let count = session.exec_direct(|engine| engine.page_count(handle)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(session.lock().available_permits(), 1);
    }

    #[test]
    fn concurrent_callers_are_serialized() {
        let session = Arc::new(session(2));
        let document = Arc::new(session.open(sample(&["a", "b", "c"])).unwrap());

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let document = document.clone();
                thread::spawn(move || {
                    for index in 0..3 {
                        let page = document.page(index).unwrap();
                        page.render_thumbnail(ThumbnailSize {
                            width_px: 32,
                            height_px: 32,
                        })
                        .unwrap();
                    }
                })
            })
            .collect();

        for caller in callers {
            caller.join().unwrap();
        }
        assert_eq!(session.dispatcher().stats().jobs_failed, 0);
    }
}
