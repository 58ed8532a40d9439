//! The daemon: accepts editor clients on a Unix socket, routes index
//! submissions and queries to projects, and persists state across
//! restarts.

pub mod jobs;
pub mod messages;

use crate::config::Settings;
use crate::error::{IndexError, IndexResult};
use crate::indexing::{IndexerJob, JobPool};
use crate::intern::LocationInterner;
use crate::parsing::{CParser, Frontend};
use crate::project::Project;
use crate::storage::{Store, Table};
use crate::types::{JobType, SourceInformation};
use jobs::JobContext;
use messages::{
    read_message, write_end, write_message, Message, ProjectKind, ProjectMessage, QueryKind,
    QueryMessage, ResponseMessage,
};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What a project was registered as, for the projects file.
#[derive(Debug, Clone)]
struct Registration {
    kind: ProjectKind,
    extra_flags: Vec<String>,
}

pub struct Server {
    settings: Settings,
    interner: Arc<LocationInterner>,
    frontend: Arc<dyn Frontend>,
    pool: Arc<JobPool>,
    projects: Mutex<HashMap<PathBuf, Arc<Project>>>,
    registered: Mutex<HashMap<PathBuf, Registration>>,
    current: Mutex<Option<PathBuf>>,
    /// Abort flags of in-flight query jobs, keyed by job id; cleared
    /// when the client goes away.
    pending: Mutex<HashMap<u32, Arc<AtomicBool>>>,
    next_job_id: AtomicU32,
    shutdown: AtomicBool,
    /// Serializes snapshot writes; the idle handler and the shutdown
    /// path can both ask for one.
    save_lock: Mutex<()>,
}

impl Server {
    pub fn new(settings: Settings) -> IndexResult<Arc<Self>> {
        std::fs::create_dir_all(&settings.data_dir).map_err(|e| IndexError::FileWrite {
            path: settings.data_dir.clone(),
            source: e,
        })?;

        let interner = Arc::new(LocationInterner::new());
        let fileids = settings.fileids_path();
        if let Ok(file) = std::fs::File::open(&fileids) {
            match interner.restore(BufReader::new(file)) {
                Ok(()) => info!(files = interner.file_count(), "restored fileids"),
                Err(err) => warn!(error = %err, "ignoring stale fileids table"),
            }
        }

        let server = Arc::new(Self {
            pool: Arc::new(JobPool::new(settings.thread_count)),
            frontend: Arc::new(CParser::new()),
            interner,
            settings,
            projects: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_job_id: AtomicU32::new(1),
            shutdown: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        });
        server.reload_projects();
        Ok(server)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn interner(&self) -> &Arc<LocationInterner> {
        &self.interner
    }

    /// Bind the socket and serve until a `Shutdown` query arrives.
    /// Returns the process exit code.
    pub fn run(self: &Arc<Self>) -> IndexResult<i32> {
        let socket_path = self.settings.socket_path();
        let listener = self.bind_with_retry(&socket_path)?;
        info!(socket = %socket_path.display(), "listening");

        for stream in listener.incoming() {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(self);
                    std::thread::spawn(move || server.handle_connection(stream));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }

        self.save();
        for project in self.projects.lock().unwrap().values() {
            project.unload();
        }
        let _ = std::fs::remove_file(&socket_path);
        info!("shut down cleanly");
        Ok(0)
    }

    /// A stale daemon may still hold the socket: nudge it with a
    /// Shutdown query once, then keep retrying on a fresh socket file.
    fn bind_with_retry(&self, socket_path: &Path) -> IndexResult<UnixListener> {
        for attempt in 0..10 {
            let _ = std::fs::remove_file(socket_path);
            match UnixListener::bind(socket_path) {
                Ok(listener) => return Ok(listener),
                Err(err) => {
                    if attempt == 0 {
                        if let Ok(mut client) = Client::connect(socket_path) {
                            let _ = client.send(Message::Query(QueryMessage::new(
                                QueryKind::Shutdown,
                                "",
                            )));
                        }
                    }
                    warn!(error = %err, attempt, "bind failed, retrying");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
        Err(IndexError::General(format!(
            "unable to listen on {}",
            socket_path.display()
        )))
    }

    fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let Ok(reader_stream) = stream.try_clone() else {
            return;
        };
        let mut reader = BufReader::new(reader_stream);
        let mut writer = BufWriter::new(stream);

        loop {
            let message = match read_message(&mut reader) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    // Malformed frame: drop the connection.
                    debug!(error = %err, "closing client connection");
                    break;
                }
            };
            let keep_open = match message {
                Message::Project(project) => self.handle_project_message(project, &mut writer),
                Message::Query(query) => self.handle_query_message(query, &mut writer),
                Message::CreateOutput { level } => {
                    self.handle_create_output(level, &mut writer);
                    false
                }
                Message::Response(_) => {
                    debug!("unexpected response frame from client");
                    false
                }
            };
            if !keep_open {
                break;
            }
        }
    }

    // ---- project handling -------------------------------------------------

    fn handle_project_message(
        self: &Arc<Self>,
        message: ProjectMessage,
        writer: &mut impl Write,
    ) -> bool {
        let result = match message.kind {
            ProjectKind::Makefile => self.project_from_compile_list(&message, writer),
            ProjectKind::Dir | ProjectKind::Smart => self.project_from_tree(&message, writer),
        };
        if let Err(err) = result {
            let _ = respond_line(writer, &format!("error: {err}"));
        }
        write_end(writer).is_ok()
    }

    /// The makefile-parser collaborator boundary: the path names a
    /// compile list with one `source|arg|arg...` line per unit.
    fn project_from_compile_list(
        self: &Arc<Self>,
        message: &ProjectMessage,
        writer: &mut impl Write,
    ) -> IndexResult<()> {
        let list = std::fs::read_to_string(&message.path).map_err(|e| IndexError::FileRead {
            path: message.path.clone(),
            source: e,
        })?;
        let src_root = message
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let project = self.ensure_project(&message.path, &src_root)?;
        self.register(&message.path, message.kind, &message.extra_flags);
        let _ = respond_line(writer, &format!("Added project {}", message.path.display()));

        project.indexer.begin_makefile();
        for line in list.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split('|');
            let Some(file) = parts.next() else { continue };
            let mut args: Vec<String> = parts.map(str::to_string).collect();
            args.extend(message.args.iter().cloned());
            args.extend(message.extra_flags.iter().cloned());
            args.extend(self.settings.default_arguments.iter().cloned());
            let source_file = src_root.join(file);
            self.process_source_file(&project, SourceInformation::new(source_file, args));
        }
        let submitted = project.indexer.end_makefile();
        let _ = respond_line(
            writer,
            &format!("Parsed {}, {} sources", message.path.display(), submitted),
        );
        self.write_projects();
        Ok(())
    }

    /// A bare source tree: synthesize one invocation per translation
    /// unit with the tree root on the include path.
    fn project_from_tree(
        self: &Arc<Self>,
        message: &ProjectMessage,
        writer: &mut impl Write,
    ) -> IndexResult<()> {
        let project = self.ensure_project(&message.path, &message.path)?;
        self.register(&message.path, message.kind, &message.extra_flags);
        let _ = respond_line(writer, &format!("Parsing {}", message.path.display()));

        let mut args = vec![format!("-I{}", project.resolved_src_root().display())];
        args.extend(message.extra_flags.iter().cloned());
        args.extend(self.settings.default_arguments.iter().cloned());

        project.indexer.begin_makefile();
        for path in project.file_manager.matching("") {
            let is_unit = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| matches!(ext, "c" | "cc" | "cpp" | "cxx" | "C"));
            if is_unit {
                self.process_source_file(&project, SourceInformation::new(path, args.clone()));
            }
        }
        let submitted = project.indexer.end_makefile();
        let _ = respond_line(
            writer,
            &format!("Parsed {}, {} sources", message.path.display(), submitted),
        );
        self.write_projects();
        Ok(())
    }

    /// Skip units whose stored invocation is identical; index the rest.
    fn process_source_file(&self, project: &Arc<Project>, source: SourceInformation) {
        let canonical = std::fs::canonicalize(&source.source_file)
            .unwrap_or_else(|_| source.source_file.clone());
        let file_id = self.interner.insert_file(&canonical);
        let incoming = SourceInformation::new(canonical, source.args);
        if project.indexer.source_info(file_id).as_ref() == Some(&incoming) {
            debug!(file = %incoming.source_file.display(), "not dirty, ignoring");
            return;
        }
        project.indexer.index(incoming, JobType::Makefile);
    }

    fn ensure_project(self: &Arc<Self>, key: &Path, src_root: &Path) -> IndexResult<Arc<Project>> {
        if let Some(project) = self.projects.lock().unwrap().get(key) {
            self.set_current(key);
            return Ok(Arc::clone(project));
        }
        let project = Project::init(
            src_root,
            self.settings.project_blob_path(key),
            &self.settings,
            Arc::clone(&self.interner),
            Arc::clone(&self.frontend),
            Arc::clone(&self.pool),
        )?;

        let server = Arc::downgrade(self);
        project
            .indexer
            .set_jobs_complete_handler(Box::new(move |count| {
                if let Some(server) = server.upgrade() {
                    debug!(count, "project idle, persisting");
                    server.save();
                }
            }));

        self.projects
            .lock()
            .unwrap()
            .insert(key.to_path_buf(), Arc::clone(&project));
        self.set_current(key);
        Ok(project)
    }

    fn register(&self, key: &Path, kind: ProjectKind, extra_flags: &[String]) {
        self.registered.lock().unwrap().insert(
            key.to_path_buf(),
            Registration {
                kind,
                extra_flags: extra_flags.to_vec(),
            },
        );
    }

    fn set_current(&self, key: &Path) {
        *self.current.lock().unwrap() = Some(key.to_path_buf());
    }

    fn current_project(&self) -> Option<Arc<Project>> {
        let current = self.current.lock().unwrap().clone()?;
        self.projects.lock().unwrap().get(&current).cloned()
    }

    /// Select the project whose source root is the longest prefix of
    /// `path`.
    fn update_project_for_location(&self, path: &Path) -> Option<Arc<Project>> {
        let projects = self.projects.lock().unwrap();
        let best = projects
            .iter()
            .filter_map(|(key, project)| {
                project.match_len(path).map(|len| (len, key.clone(), project))
            })
            .max_by_key(|(len, _, _)| *len)
            .map(|(_, key, project)| (key, Arc::clone(project)));
        drop(projects);
        if let Some((key, project)) = best {
            self.set_current(&key);
            Some(project)
        } else {
            self.current_project()
        }
    }

    // ---- queries ----------------------------------------------------------

    fn handle_query_message(
        self: &Arc<Self>,
        query: QueryMessage,
        writer: &mut BufWriter<UnixStream>,
    ) -> bool {
        match query.kind {
            QueryKind::Shutdown => {
                let _ = respond_line(writer, "Shutting down");
                let _ = write_end(writer);
                self.trigger_shutdown();
                return false;
            }
            QueryKind::Status => {
                self.stream_query(writer, move |server, ctx| server.status(&ctx));
            }
            QueryKind::FollowLocation
            | QueryKind::ReferencesLocation
            | QueryKind::CursorInfo => {
                self.location_query(writer, query);
            }
            QueryKind::ReferencesName
            | QueryKind::ListSymbols
            | QueryKind::FindSymbols => {
                let q = query.clone();
                self.stream_query(writer, move |server, ctx| {
                    let Ok(store) = Store::open_read_only(&server.settings.store_path()) else {
                        return;
                    };
                    match q.kind {
                        QueryKind::ReferencesName => {
                            jobs::references_name(&store, &server.interner, &ctx, &q.query)
                        }
                        QueryKind::ListSymbols => jobs::list_symbols(&store, &ctx, &q.query),
                        _ => jobs::find_symbols(&store, &server.interner, &ctx, &q.query),
                    }
                });
            }
            QueryKind::FindFile => {
                let pattern = query.query.clone();
                self.stream_query(writer, move |server, ctx| {
                    if let Some(project) = server.current_project() {
                        for path in project.file_manager.matching(&pattern) {
                            if !ctx.write(path.display().to_string()) {
                                return;
                            }
                        }
                    }
                });
            }
            QueryKind::IsIndexed => {
                let path = PathBuf::from(&query.query);
                self.stream_query(writer, move |server, ctx| {
                    let indexed = server.is_indexed(&path);
                    ctx.write(if indexed { "1" } else { "0" });
                });
            }
            QueryKind::HasFileManager => {
                let path = PathBuf::from(&query.query);
                self.stream_query(writer, move |server, ctx| {
                    let project = server.update_project_for_location(&path);
                    let has = project.is_some_and(|p| p.file_manager.contains(&path));
                    ctx.write(if has { "1" } else { "0" });
                });
            }
            QueryKind::PreprocessFile => {
                let path = PathBuf::from(&query.query);
                self.stream_query(writer, move |server, ctx| server.preprocess(&path, &ctx));
            }
            QueryKind::Reindex => {
                let q = query.clone();
                self.stream_query(writer, move |server, ctx| {
                    let Some(project) = server.current_project() else {
                        ctx.write("No project");
                        return;
                    };
                    match project.indexer.reindex(&q.query, q.match_regexp()) {
                        Ok(0) => ctx.write("No matches"),
                        Ok(count) => ctx.write(format!("Dirtied {count} files")),
                        Err(err) => ctx.write(format!("error: {err}")),
                    };
                });
            }
            QueryKind::Errors | QueryKind::FixIts => {
                let q = query.clone();
                self.stream_query(writer, move |server, ctx| {
                    let Some(project) = server.current_project() else {
                        ctx.write("No project");
                        return;
                    };
                    let filter = (!q.query.is_empty()).then(|| PathBuf::from(&q.query));
                    let text = project.indexer.errors(filter.as_deref());
                    if !text.is_empty() {
                        ctx.write(text);
                    }
                });
            }
            QueryKind::DumpFile => {
                self.dump_file(writer, &query.query);
            }
            QueryKind::Project => {
                let q = query.clone();
                self.stream_query(writer, move |server, ctx| server.project_query(&q.query, &ctx));
            }
            QueryKind::DeleteProject | QueryKind::UnloadProject => {
                let q = query.clone();
                self.stream_query(writer, move |server, ctx| {
                    server.remove_projects(&q.query, q.kind == QueryKind::DeleteProject, &ctx);
                });
            }
            QueryKind::ReloadProjects => {
                self.stream_query(writer, move |server, ctx| {
                    let old = server.projects.lock().unwrap().len();
                    server.reload_projects();
                    let new = server.projects.lock().unwrap().len();
                    ctx.write(format!("Changed from {old} to {new} projects"));
                });
            }
            QueryKind::ClearProjects => {
                self.stream_query(writer, move |server, ctx| {
                    server.clear_projects();
                    ctx.write("Cleared projects");
                });
            }
        }
        true
    }

    /// Queries keyed by a `path,offset` location.
    fn location_query(self: &Arc<Self>, writer: &mut BufWriter<UnixStream>, query: QueryMessage) {
        self.stream_query(writer, move |server, ctx| {
            let Some(raw) = query.location.as_deref() else {
                ctx.write("Invalid location");
                return;
            };
            let Some(loc) = jobs::parse_location(raw, &server.interner) else {
                ctx.write("Not indexed");
                return;
            };
            server.update_project_for_location(&server.interner.path(loc.file_id()));
            let Ok(store) = Store::open_read_only(&server.settings.store_path()) else {
                return;
            };
            match query.kind {
                QueryKind::FollowLocation => {
                    match jobs::follow_location(&store, &server.interner, loc) {
                        Some(line) => ctx.write(line),
                        None => ctx.write("Not found"),
                    };
                }
                QueryKind::ReferencesLocation => {
                    jobs::references_location(&store, &server.interner, &ctx, loc)
                }
                _ => jobs::cursor_info(&store, &server.interner, &ctx, loc),
            }
        });
    }

    /// Run a query job on the pool and forward its output lines to the
    /// client. A failed write flips the job's abort flag, so a client
    /// that disconnects mid-stream cancels its job.
    fn stream_query<F>(self: &Arc<Self>, writer: &mut BufWriter<UnixStream>, job: F)
    where
        F: FnOnce(Arc<Server>, JobContext) + Send + 'static,
    {
        let (ctx, rx, aborted) = JobContext::channel();
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .unwrap()
            .insert(job_id, Arc::clone(&aborted));

        let server = Arc::clone(self);
        self.pool.spawn(false, move || job(server, ctx));

        for line in rx.iter() {
            let frame = Message::Response(ResponseMessage {
                bytes: line.into_bytes(),
            });
            if write_message(writer, &frame).is_err() {
                aborted.store(true, Ordering::Relaxed);
                break;
            }
        }
        let _ = write_end(writer);
        self.pending.lock().unwrap().remove(&job_id);
    }

    fn dump_file(self: &Arc<Self>, writer: &mut BufWriter<UnixStream>, path: &str) {
        let path = PathBuf::from(path);
        self.stream_query(writer, move |server, ctx| {
            let canonical = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            let source = server
                .interner
                .file_id(&canonical)
                .and_then(|file_id| {
                    server
                        .update_project_for_location(&canonical)
                        .and_then(|project| project.indexer.source_info(file_id))
                });
            let Some(source) = source else {
                ctx.write(format!("{} is not indexed", path.display()));
                return;
            };
            let job = IndexerJob::new(
                source,
                JobType::Dump,
                Arc::clone(&server.frontend),
                Arc::clone(&server.interner),
            );
            let mut sink = |line: String| {
                ctx.write(line);
            };
            if let Err(err) = job.run_dump(&mut sink) {
                ctx.write(format!("error: {err}"));
            }
        });
    }

    fn status(&self, ctx: &JobContext) {
        {
            let projects = self.projects.lock().unwrap();
            let current = self.current.lock().unwrap().clone();
            ctx.write(format!("projects: {}", projects.len()));
            for (key, project) in projects.iter() {
                ctx.write(format!(
                    "  {}{} ({} sources, {} files)",
                    key.display(),
                    if Some(key) == current.as_ref() { " <=" } else { "" },
                    project.indexer.source_count(),
                    project.file_manager.len(),
                ));
            }
        }
        if let Ok(store) = Store::open_read_only(&self.settings.store_path()) {
            for table in [
                Table::SymbolName,
                Table::Symbol,
                Table::Dependency,
                Table::FileInformation,
            ] {
                if let Ok(count) = store.count(table) {
                    if !ctx.write(format!("{}: {} keys", table.name(), count)) {
                        return;
                    }
                }
            }
        }
        ctx.write(format!("fileids: {}", self.interner.file_count()));
    }

    fn is_indexed(&self, path: &Path) -> bool {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if canonical.is_dir() {
            return self
                .update_project_for_location(&canonical)
                .is_some_and(|p| p.file_manager.contains(&canonical));
        }
        let Some(project) = self.update_project_for_location(&canonical) else {
            return false;
        };
        self.interner
            .file_id(&canonical)
            .is_some_and(|file_id| project.is_indexed(file_id))
    }

    fn preprocess(&self, path: &Path, ctx: &JobContext) {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let args = self
            .interner
            .file_id(&canonical)
            .and_then(|file_id| {
                self.update_project_for_location(&canonical)
                    .and_then(|project| project.indexer.source_info(file_id))
            })
            .map(|source| source.args);
        let Some(args) = args else {
            ctx.write(format!("No arguments for {}", path.display()));
            return;
        };
        ctx.write(format!("// {} {}", canonical.display(), args.join(" ")));
        match std::fs::read_to_string(&canonical) {
            Ok(content) => {
                for line in content.lines() {
                    if !ctx.write(line) {
                        return;
                    }
                }
            }
            Err(err) => {
                ctx.write(format!("error: {err}"));
            }
        }
    }

    fn project_query(&self, pattern: &str, ctx: &JobContext) {
        if pattern.is_empty() {
            let projects = self.projects.lock().unwrap();
            let current = self.current.lock().unwrap().clone();
            for key in projects.keys() {
                ctx.write(format!(
                    "{}{}",
                    key.display(),
                    if Some(key) == current.as_ref() { " <=" } else { "" }
                ));
            }
            return;
        }
        let matches: Vec<PathBuf> = {
            let projects = self.projects.lock().unwrap();
            projects
                .keys()
                .filter(|key| key.to_string_lossy().contains(pattern))
                .cloned()
                .collect()
        };
        match matches.len() {
            0 => {
                ctx.write(format!("No matches for {pattern}"));
            }
            1 => {
                self.set_current(&matches[0]);
                ctx.write(format!("Selected project: {}", matches[0].display()));
            }
            _ => {
                ctx.write(format!("Multiple matches for {pattern}"));
                for key in matches {
                    ctx.write(key.display().to_string());
                }
            }
        }
    }

    fn remove_projects(&self, pattern: &str, delete: bool, ctx: &JobContext) {
        let keys: Vec<PathBuf> = {
            let projects = self.projects.lock().unwrap();
            projects
                .keys()
                .filter(|key| key.to_string_lossy().contains(pattern))
                .cloned()
                .collect()
        };
        for key in keys {
            let removed = self.projects.lock().unwrap().remove(&key);
            if let Some(project) = removed {
                project.unload();
            }
            {
                let mut current = self.current.lock().unwrap();
                if current.as_ref() == Some(&key) {
                    *current = None;
                }
            }
            if delete {
                self.registered.lock().unwrap().remove(&key);
                let _ = std::fs::remove_file(self.settings.project_blob_path(&key));
            }
            ctx.write(format!(
                "{} project: {}",
                if delete { "Deleted" } else { "Unloaded" },
                key.display()
            ));
        }
        if delete {
            self.write_projects();
        }
    }

    fn clear_projects(&self) {
        let projects: Vec<Arc<Project>> =
            self.projects.lock().unwrap().drain().map(|(_, p)| p).collect();
        for project in projects {
            project.unload();
        }
        *self.current.lock().unwrap() = None;
        self.registered.lock().unwrap().clear();
        let _ = std::fs::remove_dir_all(&self.settings.data_dir);
        let _ = std::fs::create_dir_all(&self.settings.data_dir);
        self.write_projects();
    }

    fn handle_create_output(self: &Arc<Self>, level: u32, writer: &mut BufWriter<UnixStream>) {
        debug!(level, "log stream subscribed");
        // Compile errors already on record are delivered immediately.
        if let Some(project) = self.current_project() {
            let errors = project.indexer.errors(None);
            if !errors.is_empty() {
                let _ = respond_line(writer, &errors);
            }
        }
        let _ = write_end(writer);
    }

    fn trigger_shutdown(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::Relaxed);
        for (_, aborted) in self.pending.lock().unwrap().iter() {
            aborted.store(true, Ordering::Relaxed);
        }
        // Unblock the accept loop.
        let _ = UnixStream::connect(self.settings.socket_path());
    }

    // ---- persistence ------------------------------------------------------

    /// Write the fileids table and every project's restore blob.
    pub fn save(&self) {
        let _guard = self.save_lock.lock().unwrap();
        let fileids = self.settings.fileids_path();
        if let Err(err) = atomic_write(&fileids, |writer| self.interner.snapshot(writer)) {
            error!(error = %err, "cannot save fileids");
        }
        let projects = self.projects.lock().unwrap();
        for (key, project) in projects.iter() {
            if let Err(err) = project.save() {
                error!(error = %err, project = %key.display(), "cannot save project");
            }
        }
    }

    /// Re-read the projects file and instantiate whatever it lists.
    fn reload_projects(self: &Arc<Self>) {
        let path = self.settings.projects_path();
        let Ok(content) = std::fs::read_to_string(&path) else {
            return;
        };
        let mut group = String::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                group = name.to_string();
                continue;
            }
            let (raw_path, flags) = match line.split_once('|') {
                Some((p, rest)) => (p, rest.split('|').map(str::to_string).collect()),
                None => (line, Vec::new()),
            };
            let key = PathBuf::from(raw_path);
            let kind = match group.as_str() {
                "Makefiles" => ProjectKind::Makefile,
                "Dirs" => ProjectKind::Dir,
                "SmartProjects" => ProjectKind::Smart,
                _ => continue,
            };
            let src_root = match kind {
                ProjectKind::Makefile => key
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("/")),
                _ => key.clone(),
            };
            match self.ensure_project(&key, &src_root) {
                Ok(_) => self.register(&key, kind, &flags),
                Err(err) => error!(error = %err, project = %key.display(), "cannot load project"),
            }
        }
    }

    fn write_projects(&self) {
        let registered = self.registered.lock().unwrap();
        let mut groups: HashMap<&str, Vec<String>> = HashMap::new();
        for (path, registration) in registered.iter() {
            let group = match registration.kind {
                ProjectKind::Makefile => "Makefiles",
                ProjectKind::Dir => "Dirs",
                ProjectKind::Smart => "SmartProjects",
            };
            let mut line = path.display().to_string();
            if !registration.extra_flags.is_empty() {
                line.push('|');
                line.push_str(&registration.extra_flags.join("|"));
            }
            groups.entry(group).or_default().push(line);
        }
        let mut out = String::new();
        for group in ["Makefiles", "Dirs", "SmartProjects"] {
            if let Some(lines) = groups.get(group) {
                out.push_str(&format!("[{group}]\n"));
                let mut lines = lines.clone();
                lines.sort();
                for line in lines {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
        }
        if let Err(err) = std::fs::write(self.settings.projects_path(), out) {
            error!(error = %err, "cannot write projects file");
        }
    }
}

fn respond_line(writer: &mut impl Write, line: &str) -> std::io::Result<()> {
    write_message(
        writer,
        &Message::Response(ResponseMessage {
            bytes: line.as_bytes().to_vec(),
        }),
    )
}

/// Write-temp-then-rename, so a crash never leaves a half-written blob.
fn atomic_write<F>(path: &Path, write: F) -> IndexResult<()>
where
    F: FnOnce(&mut BufWriter<std::fs::File>) -> IndexResult<()>,
{
    let tmp = path.with_extension("tmp");
    let file = std::fs::File::create(&tmp).map_err(|e| IndexError::FileWrite {
        path: tmp.clone(),
        source: e,
    })?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    writer.flush().map_err(|e| IndexError::FileWrite {
        path: tmp.clone(),
        source: e,
    })?;
    drop(writer);
    std::fs::rename(&tmp, path).map_err(|e| IndexError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Minimal client for tools and tests: send one message, collect the
/// response lines.
pub struct Client {
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
}

impl Client {
    pub fn connect(socket_path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path)?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: BufWriter::new(stream),
        })
    }

    /// Send one message and read lines until the terminating zero frame.
    pub fn send(&mut self, message: Message) -> std::io::Result<Vec<String>> {
        write_message(&mut self.writer, &message)?;

        let mut lines = Vec::new();
        loop {
            match read_message(&mut self.reader)? {
                Some(Message::Response(response)) => {
                    lines.push(String::from_utf8_lossy(&response.bytes).into_owned());
                }
                Some(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "unexpected frame from server",
                    ));
                }
                None => return Ok(lines),
            }
        }
    }
}
