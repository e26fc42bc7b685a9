//! Cgroup driver backed by the privileged cgroup manager daemon. Every
//! operation is a synchronous request to the daemon over its local bus
//! socket; the daemon owns the hierarchies and performs the filesystem work.

pub mod bus;
mod creds;
mod message;
mod mount;
pub mod serialize;

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;
use std::sync::Mutex;

use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType};
use nix::unistd::{geteuid, getpid, Pid};

use crate::common::{
    self, controller_of, lock_or_abort, CgroupDriver, ContainerCgroup, CGROUP_PROCS, CGROUP_TASKS,
};
use crate::config::CgroupConfig;
use crate::error::CgroupError;
use crate::nsexec;
use crate::planner::{self, Claim, PathBackend};
use crate::registry;

use self::bus::BusConnection;
use self::serialize::{BusSerialize, FdIndex};

const CGMANAGER_BUS_ADDR: &str = "unix:path=/sys/fs/cgroup/cgmanager/sock";
const OBJECT_PATH: &str = "/org/linuxcontainers/cgmanager";
const INTERFACE: &str = "org.linuxcontainers.cgmanager0_0";

const REMOVE_RECURSIVE: i32 = 1;
const FREEZER_STATE: &str = "freezer.state";
const FREEZER_THAWED: &str = "THAWED";

fn daemon_socket_path() -> &'static str {
    CGMANAGER_BUS_ADDR.trim_start_matches("unix:path=")
}

pub struct CgmDriver {
    address: String,
    /// The one process-wide daemon connection. The lock is held for the full
    /// duration of every request so replies cannot interleave.
    conn: Mutex<Option<BusConnection>>,
    subsystems: Vec<String>,
    name_retry_limit: u32,
}

impl CgmDriver {
    pub fn new(config: &CgroupConfig) -> Result<Self, CgroupError> {
        let subsystems = registry::enabled_controllers()?.as_ref().clone();
        Self::with_address(daemon_socket_path(), subsystems, config)
    }

    pub(crate) fn with_address(
        address: &str,
        subsystems: Vec<String>,
        config: &CgroupConfig,
    ) -> Result<Self, CgroupError> {
        let conn = Self::open_connection(address)?;
        let driver = Self {
            address: address.into(),
            conn: Mutex::new(Some(conn)),
            subsystems,
            name_retry_limit: config.name_retry_limit,
        };

        // As the real superuser we may still sit in some login session's
        // cgroup. Escape to the root so container cgroups become children of
        // "/" rather than of wherever we were started from.
        if geteuid().is_root() {
            driver.escape_to_root()?;
        }

        Ok(driver)
    }

    fn open_connection(address: &str) -> Result<BusConnection, CgroupError> {
        let conn = BusConnection::connect(address)?;
        // A first round-trip proves the daemon answers and completes the
        // capability negotiation before anything depends on it.
        conn.method_call::<_, ()>(OBJECT_PATH, INTERFACE, "Ping", Some(0i32), &[])?;
        Ok(conn)
    }

    /// One daemon request. Holds the connection lock across the round-trip.
    /// When the connection turns out to be gone, the handle is dropped, one
    /// reconnect is attempted for the callers that come after us, and the
    /// current request fails as disconnected.
    fn call<Body, Out>(&self, member: &str, body: Body, fds: &[RawFd]) -> Result<Out, CgroupError>
    where
        Body: BusSerialize,
        Out: BusSerialize,
    {
        let mut guard = lock_or_abort(&self.conn);

        if guard.is_none() {
            match Self::open_connection(&self.address) {
                Ok(conn) => {
                    tracing::info!("new cgroup manager connection was opened");
                    *guard = Some(conn);
                }
                Err(err) => {
                    tracing::warn!("cgroup manager unable to re-open connection: {err}");
                    return Err(CgroupError::Disconnected);
                }
            }
        }
        let conn = guard.as_ref().expect("connection was just established");

        match conn.method_call(OBJECT_PATH, INTERFACE, member, Some(body), fds) {
            Ok(out) => Ok(out),
            Err(err) if err.is_disconnect() => {
                tracing::warn!("cgroup manager connection was terminated: {err}");
                *guard = None;
                match Self::open_connection(&self.address) {
                    Ok(conn) => {
                        tracing::info!("new cgroup manager connection was opened");
                        *guard = Some(conn);
                    }
                    Err(reconnect_err) => {
                        tracing::warn!(
                            "cgroup manager unable to re-open connection: {reconnect_err}"
                        );
                    }
                }
                Err(CgroupError::Disconnected)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn cgm_create(&self, controller: &str, path: &str) -> Result<i32, CgroupError> {
        self.call(
            "Create",
            (controller.to_string(), path.to_string()),
            &[],
        )
    }

    fn cgm_remove(&self, controller: &str, path: &str) -> Result<i32, CgroupError> {
        self.call(
            "Remove",
            (controller.to_string(), path.to_string(), REMOVE_RECURSIVE),
            &[],
        )
    }

    fn cgm_chmod(
        &self,
        controller: &str,
        path: &str,
        file: &str,
        mode: i32,
    ) -> Result<(), CgroupError> {
        self.call(
            "Chmod",
            (
                controller.to_string(),
                path.to_string(),
                file.to_string(),
                mode,
            ),
            &[],
        )
    }

    fn cgm_chown_scm(&self, controller: &str, path: &str, sock: RawFd) -> Result<(), CgroupError> {
        self.call(
            "ChownScm",
            (controller.to_string(), path.to_string(), FdIndex(0)),
            &[sock],
        )
    }

    fn cgm_move_pid(&self, controller: &str, path: &str, pid: Pid) -> Result<(), CgroupError> {
        self.call(
            "MovePid",
            (controller.to_string(), path.to_string(), pid.as_raw()),
            &[],
        )
    }

    fn cgm_move_pid_abs(&self, controller: &str, path: &str, pid: Pid) -> Result<(), CgroupError> {
        self.call(
            "MovePidAbs",
            (controller.to_string(), path.to_string(), pid.as_raw()),
            &[],
        )
    }

    fn cgm_set_value(
        &self,
        controller: &str,
        path: &str,
        key: &str,
        value: &str,
    ) -> Result<(), CgroupError> {
        self.call(
            "SetValue",
            (
                controller.to_string(),
                path.to_string(),
                key.to_string(),
                value.to_string(),
            ),
            &[],
        )
    }

    fn cgm_get_value(&self, controller: &str, path: &str, key: &str) -> Result<String, CgroupError> {
        self.call(
            "GetValue",
            (controller.to_string(), path.to_string(), key.to_string()),
            &[],
        )
    }

    fn cgm_get_tasks(&self, controller: &str, path: &str) -> Result<Vec<i32>, CgroupError> {
        self.call("GetTasks", (controller.to_string(), path.to_string()), &[])
    }

    /// Moves this process to the root cgroup of every controller, detaching
    /// it from whatever cgroup it inherited.
    fn escape_to_root(&self) -> Result<(), CgroupError> {
        let me = getpid();
        for controller in &self.subsystems {
            self.cgm_move_pid_abs(controller, "/", me)?;
        }
        Ok(())
    }

    fn remove_everywhere(&self, path: &str) -> bool {
        let mut ok = true;
        for controller in &self.subsystems {
            match self.cgm_remove(controller, path) {
                Ok(existed) if existed == -1 => {
                    tracing::info!("cgroup removal attempt: {controller}:{path} did not exist");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("error removing {controller}:{path}: {err}");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Asks the daemon to chown one controller's cgroup into the container's
    /// user namespace, then opens the directory up so in-namespace root can
    /// manage sub-cgroups.
    fn chown_controller(
        &self,
        controller: &str,
        path: &str,
        config: &CgroupConfig,
    ) -> Result<(), CgroupError> {
        let target_uid = config.container_uid(geteuid().as_raw());

        // The exchange has to happen from inside the namespace; only then
        // does the kernel translate the claimed uids the way the daemon
        // expects. The helper shares our daemon connection across the fork,
        // so the connection lock must not be held here.
        let status = nsexec::run_as_namespace_root(&config.id_map, || {
            match self.chown_handshake(controller, path, target_uid) {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!("cgroup chown handshake failed: {err}");
                    1
                }
            }
        })?;

        if status != 0 {
            return Err(CgroupError::ChownFailed {
                controller: controller.into(),
                path: path.into(),
            });
        }

        for file in ["", CGROUP_TASKS, CGROUP_PROCS] {
            self.cgm_chmod(controller, path, file, 0o775)?;
        }

        Ok(())
    }

    fn chown_handshake(
        &self,
        controller: &str,
        path: &str,
        target_uid: u32,
    ) -> Result<(), CgroupError> {
        let (near, far) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )?;
        socket::setsockopt(&near, sockopt::PassCred, &true)?;
        socket::setsockopt(&far, sockopt::PassCred, &true)?;

        self.cgm_chown_scm(controller, path, far.as_raw_fd())?;

        creds::exchange(near.as_fd(), target_uid).map_err(|err| {
            tracing::error!("credential exchange for {controller}:{path} failed: {err}");
            CgroupError::ChownFailed {
                controller: controller.into(),
                path: path.into(),
            }
        })
    }
}

struct CgmBackend<'a> {
    driver: &'a CgmDriver,
}

impl PathBackend for CgmBackend<'_> {
    fn claim(&self, candidate: &str) -> Result<Claim, CgroupError> {
        for controller in &self.driver.subsystems {
            match self.driver.cgm_create(controller, candidate) {
                Ok(existed) if existed == 1 => {
                    let _ = self.driver.remove_everywhere(candidate);
                    return Ok(Claim::Exists);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!("error creating cgroup {controller}:{candidate}: {err}");
                    let _ = self.driver.remove_everywhere(candidate);
                    return Err(err);
                }
            }
        }

        Ok(Claim::Created)
    }
}

impl CgroupDriver for CgmDriver {
    fn name(&self) -> &'static str {
        "cgmanager"
    }

    fn create(&self, cg: &mut ContainerCgroup) -> Result<(), CgroupError> {
        let backend = CgmBackend { driver: self };
        let candidate = planner::allocate(
            cg.pattern(),
            cg.name(),
            self.name_retry_limit,
            &backend,
        )?;

        cg.set_relative_path(candidate);
        Ok(())
    }

    fn enter(&self, cg: &ContainerCgroup, pid: Pid) -> Result<(), CgroupError> {
        self.attach(cg.path_or_err()?, pid)
    }

    fn chown(&self, cg: &ContainerCgroup, config: &CgroupConfig) -> bool {
        if config.id_map.is_empty() {
            // Without a mapping there is no foreign owner to hand over to.
            return true;
        }

        let Ok(path) = cg.path_or_err() else {
            return false;
        };

        let mut ok = true;
        for controller in &self.subsystems {
            if let Err(err) = self.chown_controller(controller, path, config) {
                tracing::warn!(
                    "failed to chown {controller}:{path} to container root: {err}"
                );
                ok = false;
            }
        }

        ok
    }

    fn get(&self, path: &str, key: &str) -> Result<String, CgroupError> {
        let controller = controller_of(key)?;
        // The daemon does not terminate the last entry with a newline.
        let value = self.cgm_get_value(controller, path, key)?;
        Ok(common::ensure_trailing_newline(value))
    }

    fn set(&self, path: &str, key: &str, value: &str) -> Result<(), CgroupError> {
        let controller = controller_of(key)?;
        self.cgm_set_value(controller, path, key, value)
    }

    fn nr_tasks(&self, cg: &ContainerCgroup) -> Result<usize, CgroupError> {
        let path = cg.path_or_err()?;
        let first = self.subsystems.first().ok_or(CgroupError::NoControllers)?;
        Ok(self.cgm_get_tasks(first, path)?.len())
    }

    fn unfreeze(&self, cg: &ContainerCgroup) -> Result<(), CgroupError> {
        let path = cg.path_or_err()?;
        self.cgm_set_value("freezer", path, FREEZER_STATE, FREEZER_THAWED)
    }

    fn attach(&self, path: &str, pid: Pid) -> Result<(), CgroupError> {
        // All controllers carry the same cgroup name; the daemon moves the
        // task per controller.
        for controller in &self.subsystems {
            self.cgm_move_pid(controller, path, pid)?;
        }
        Ok(())
    }

    fn destroy(&self, cg: &ContainerCgroup) -> bool {
        let Some(path) = cg.relative_path() else {
            return true;
        };

        self.remove_everywhere(path)
    }

    fn mount_cgroup(&self, root: &Path) -> Result<(), CgroupError> {
        mount::mount_daemon_socket(root)
    }

    fn disconnect(&self) {
        *lock_or_abort(&self.conn) = None;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::io::{Read, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::sync::{Arc, Mutex};

    use tempfile::TempDir;

    use super::message::{FieldKind, FieldValue, HeaderField, Message, MessageKind};
    use super::*;

    /// A scripted stand-in for the daemon: it speaks just enough of the bus
    /// protocol to authenticate a client and answer the driver's verbs.
    #[derive(Default)]
    struct DaemonState {
        /// `controller:path` pairs that currently exist.
        existing: HashSet<String>,
        values: HashMap<String, String>,
        /// Every handled verb, rendered as `Member arg arg …`.
        log: Vec<String>,
        /// When set, the connection is dropped without replying once this
        /// many further calls came in.
        drop_after: Option<usize>,
        calls_until_drop: usize,
    }

    struct FakeDaemon {
        state: Arc<Mutex<DaemonState>>,
        socket_path: std::path::PathBuf,
        _dir: TempDir,
    }

    impl FakeDaemon {
        fn start() -> Self {
            let dir = TempDir::new().expect("create temp directory for test");
            let socket_path = dir.path().join("sock");
            let listener = UnixListener::bind(&socket_path).expect("bind daemon socket");
            let state = Arc::new(Mutex::new(DaemonState::default()));

            let thread_state = state.clone();
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let _ = serve_connection(&mut stream, &thread_state);
                }
            });

            Self {
                state,
                socket_path,
                _dir: dir,
            }
        }

        fn address(&self) -> String {
            self.socket_path.to_str().expect("utf-8 socket path").into()
        }

        fn seed_cgroup(&self, controller: &str, path: &str) {
            self.state
                .lock()
                .unwrap()
                .existing
                .insert(format!("{controller}:{path}"));
        }

        fn seed_value(&self, key: &str, value: &str) {
            self.state
                .lock()
                .unwrap()
                .values
                .insert(key.into(), value.into());
        }

        fn has_cgroup(&self, controller: &str, path: &str) -> bool {
            self.state
                .lock()
                .unwrap()
                .existing
                .contains(&format!("{controller}:{path}"))
        }

        fn drop_connection_after(&self, calls: usize) {
            let mut state = self.state.lock().unwrap();
            state.drop_after = Some(calls);
            state.calls_until_drop = 0;
        }

        fn take_log(&self) -> Vec<String> {
            std::mem::take(&mut self.state.lock().unwrap().log)
        }
    }

    fn read_line(stream: &mut UnixStream) -> Option<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match stream.read(&mut byte) {
                Ok(1) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        return Some(String::from_utf8_lossy(&line).into_owned());
                    }
                }
                _ => return None,
            }
        }
    }

    fn read_request(stream: &mut UnixStream) -> Option<Vec<u8>> {
        let mut fixed = [0u8; 16];
        stream.read_exact(&mut fixed).ok()?;

        let body_len = u32::from_le_bytes(fixed[4..8].try_into().unwrap()) as usize;
        let fields_len = u32::from_le_bytes(fixed[12..16].try_into().unwrap()) as usize;
        let padded_fields = (fields_len + 7) / 8 * 8;

        let mut rest = vec![0u8; padded_fields + body_len];
        stream.read_exact(&mut rest).ok()?;

        let mut wire = fixed.to_vec();
        wire.extend(rest);
        Some(wire)
    }

    fn method_return(serial: u32, body: Option<(&str, Vec<u8>)>) -> Vec<u8> {
        let mut fields = vec![HeaderField {
            kind: FieldKind::ReplySerial,
            value: FieldValue::U32(serial),
        }];
        let body = match body {
            Some((signature, body)) => {
                fields.push(HeaderField::body_signature(signature));
                body
            }
            None => Vec::new(),
        };

        Message {
            kind: MessageKind::MethodReturn,
            serial: u32::MAX,
            fields,
            body,
        }
        .serialize()
    }

    fn error_return(serial: u32, text: &str) -> Vec<u8> {
        let mut body = Vec::new();
        text.to_string().serialize(&mut body);
        Message {
            kind: MessageKind::Error,
            serial: u32::MAX,
            fields: vec![
                HeaderField {
                    kind: FieldKind::ReplySerial,
                    value: FieldValue::U32(serial),
                },
                HeaderField {
                    kind: FieldKind::ErrorName,
                    value: FieldValue::Str("org.freedesktop.DBus.Error.Failed".into()),
                },
                HeaderField::body_signature("s"),
            ],
            body,
        }
        .serialize()
    }

    fn serve_connection(stream: &mut UnixStream, state: &Arc<Mutex<DaemonState>>) -> Option<()> {
        // Null byte + AUTH, NEGOTIATE_UNIX_FD, BEGIN.
        read_line(stream)?;
        stream.write_all(b"OK 74657374696e672d6f6e6c79\r\n").ok()?;
        read_line(stream)?;
        stream.write_all(b"AGREE_UNIX_FD\r\n").ok()?;
        read_line(stream)?;

        loop {
            let wire = read_request(stream)?;
            let (request, _) = Message::deserialize(&wire).expect("parse request");

            {
                let mut state = state.lock().unwrap();
                if let Some(limit) = state.drop_after {
                    if state.calls_until_drop >= limit {
                        state.drop_after = None;
                        return None;
                    }
                    state.calls_until_drop += 1;
                }
            }

            let reply = handle_request(&request, state);
            stream.write_all(&reply).ok()?;
        }
    }

    fn handle_request(request: &Message, state: &Arc<Mutex<DaemonState>>) -> Vec<u8> {
        let member = request
            .field(FieldKind::Member)
            .and_then(|v| v.as_str())
            .expect("request has a member")
            .to_string();
        let serial = request.serial;
        let mut cursor = 0;
        let mut state = state.lock().unwrap();

        match member.as_str() {
            "Ping" => method_return(serial, None),
            "Create" => {
                let (controller, path) =
                    <(String, String)>::deserialize(&request.body, &mut cursor).unwrap();
                state.log.push(format!("Create {controller} {path}"));
                let key = format!("{controller}:{path}");
                let existed = if state.existing.contains(&key) {
                    1i32
                } else {
                    state.existing.insert(key);
                    0i32
                };
                let mut body = Vec::new();
                existed.serialize(&mut body);
                method_return(serial, Some(("i", body)))
            }
            "Remove" => {
                let (controller, path, _recursive) =
                    <(String, String, i32)>::deserialize(&request.body, &mut cursor).unwrap();
                state.log.push(format!("Remove {controller} {path}"));
                let existed = if state.existing.remove(&format!("{controller}:{path}")) {
                    0i32
                } else {
                    -1i32
                };
                let mut body = Vec::new();
                existed.serialize(&mut body);
                method_return(serial, Some(("i", body)))
            }
            "MovePid" | "MovePidAbs" => {
                let (controller, path, pid) =
                    <(String, String, i32)>::deserialize(&request.body, &mut cursor).unwrap();
                state.log.push(format!("{member} {controller} {path} {pid}"));
                method_return(serial, None)
            }
            "SetValue" => {
                let (controller, path, key, value) =
                    <(String, String, String, String)>::deserialize(&request.body, &mut cursor)
                        .unwrap();
                state
                    .log
                    .push(format!("SetValue {controller} {path} {key} {value}"));
                state.values.insert(key, value);
                method_return(serial, None)
            }
            "GetValue" => {
                let (controller, path, key) =
                    <(String, String, String)>::deserialize(&request.body, &mut cursor).unwrap();
                state.log.push(format!("GetValue {controller} {path} {key}"));
                match state.values.get(&key) {
                    Some(value) => {
                        let mut body = Vec::new();
                        value.clone().serialize(&mut body);
                        method_return(serial, Some(("s", body)))
                    }
                    None => error_return(serial, "invalid request"),
                }
            }
            "GetTasks" => {
                let (controller, path) =
                    <(String, String)>::deserialize(&request.body, &mut cursor).unwrap();
                state.log.push(format!("GetTasks {controller} {path}"));
                let mut body = Vec::new();
                vec![100i32, 200, 300].serialize(&mut body);
                method_return(serial, Some(("ai", body)))
            }
            "Chmod" => {
                let (controller, path, file, mode) =
                    <(String, String, String, i32)>::deserialize(&request.body, &mut cursor)
                        .unwrap();
                state
                    .log
                    .push(format!("Chmod {controller} {path} {file} {mode:o}"));
                method_return(serial, None)
            }
            other => error_return(serial, &format!("unknown method {other}")),
        }
    }

    fn controllers() -> Vec<String> {
        vec!["cpu".into(), "memory".into(), "freezer".into()]
    }

    fn connect(daemon: &FakeDaemon) -> CgmDriver {
        let driver = CgmDriver::with_address(
            &daemon.address(),
            controllers(),
            &CgroupConfig::default(),
        )
        .expect("connect to fake daemon");
        // Discard any escape traffic from a root test environment.
        daemon.take_log();
        driver
    }

    fn created_cgroup(driver: &CgmDriver) -> ContainerCgroup {
        let mut cg = ContainerCgroup::new("c1", &CgroupConfig::default());
        driver.create(&mut cg).expect("create cgroup");
        cg
    }

    #[test]
    fn test_create_picks_the_plain_name_when_free() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);

        let mut cg = ContainerCgroup::new("c1", &CgroupConfig::default());
        driver.create(&mut cg).expect("create cgroup");

        assert_eq!(cg.relative_path(), Some("c1"));
        for controller in ["cpu", "memory", "freezer"] {
            assert!(daemon.has_cgroup(controller, "c1"));
        }
    }

    #[test]
    fn test_create_collision_rolls_back_and_retries() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        daemon.seed_cgroup("memory", "c1");

        let mut cg = ContainerCgroup::new("c1", &CgroupConfig::default());
        driver.create(&mut cg).expect("create cgroup");

        assert_eq!(cg.relative_path(), Some("c1-1"));
        // The cpu-side c1 made before the collision is gone again.
        assert!(!daemon.has_cgroup("cpu", "c1"));
        for controller in ["cpu", "memory", "freezer"] {
            assert!(daemon.has_cgroup(controller, "c1-1"));
        }

        let log = daemon.take_log();
        assert_eq!(log[0], "Create cpu c1");
        assert_eq!(log[1], "Create memory c1");
        assert!(log.contains(&"Remove cpu c1".to_string()));
        assert_eq!(log.last().unwrap(), "Create freezer c1-1");
    }

    #[test]
    fn test_enter_moves_the_pid_for_every_controller() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        let cg = created_cgroup(&driver);
        daemon.take_log();

        driver.enter(&cg, Pid::from_raw(1234)).expect("enter");

        assert_eq!(
            daemon.take_log(),
            vec![
                "MovePid cpu c1 1234",
                "MovePid memory c1 1234",
                "MovePid freezer c1 1234"
            ]
        );
    }

    #[test]
    fn test_get_appends_the_missing_newline() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        daemon.seed_value("memory.limit_in_bytes", "1048576");

        let value = driver.get("c1", "memory.limit_in_bytes").expect("get");
        assert_eq!(value, "1048576\n");
    }

    #[test]
    fn test_get_unknown_key_is_a_daemon_error() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);

        let err = driver.get("c1", "memory.bogus").unwrap_err();
        assert!(matches!(err, CgroupError::Bus(_)));
    }

    #[test]
    fn test_get_unqualified_key_never_reaches_the_daemon() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);

        assert!(matches!(
            driver.get("c1", "memory"),
            Err(CgroupError::UnknownKey(_))
        ));
        assert!(daemon.take_log().is_empty());
    }

    #[test]
    fn test_set_routes_through_the_key_controller() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);

        driver
            .set("c1", "memory.limit_in_bytes", "1048576")
            .expect("set");

        assert_eq!(
            daemon.take_log(),
            vec!["SetValue memory c1 memory.limit_in_bytes 1048576"]
        );

        // What was set reads back, newline-terminated.
        let value = driver.get("c1", "memory.limit_in_bytes").expect("get");
        assert_eq!(value, "1048576\n");
    }

    #[test]
    fn test_nr_tasks_counts_the_first_controller() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        let cg = created_cgroup(&driver);
        daemon.take_log();

        assert_eq!(driver.nr_tasks(&cg).expect("count tasks"), 3);
        assert_eq!(daemon.take_log(), vec!["GetTasks cpu c1"]);
    }

    #[test]
    fn test_unfreeze_thaws_through_the_freezer_controller() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        let cg = created_cgroup(&driver);
        daemon.take_log();

        driver.unfreeze(&cg).expect("unfreeze");
        assert_eq!(
            daemon.take_log(),
            vec!["SetValue freezer c1 freezer.state THAWED"]
        );
    }

    #[test]
    fn test_destroy_removes_every_controller() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        let cg = created_cgroup(&driver);

        assert!(driver.destroy(&cg));
        for controller in ["cpu", "memory", "freezer"] {
            assert!(!daemon.has_cgroup(controller, "c1"));
        }
    }

    #[test]
    fn test_destroy_treats_missing_cgroups_as_removed() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        let mut cg = ContainerCgroup::new("c1", &CgroupConfig::default());
        cg.set_relative_path("c1".into());

        // Nothing was ever created; every Remove reports "did not exist".
        assert!(driver.destroy(&cg));
    }

    #[test]
    fn test_chown_without_id_map_is_a_no_op() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        let cg = created_cgroup(&driver);
        daemon.take_log();

        assert!(driver.chown(&cg, &CgroupConfig::default()));
        assert!(daemon.take_log().is_empty());
    }

    #[test]
    fn test_dropped_connection_fails_then_reconnects() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        let cg = created_cgroup(&driver);

        // The daemon goes away before the next request is answered.
        daemon.drop_connection_after(0);
        let err = driver.enter(&cg, Pid::from_raw(1234)).unwrap_err();
        assert!(matches!(err, CgroupError::Disconnected));

        // The inline reconnect brought a fresh connection up; the retry goes
        // through.
        daemon.take_log();
        driver.enter(&cg, Pid::from_raw(1234)).expect("enter after reconnect");
        assert!(!daemon.take_log().is_empty());
    }

    #[test]
    fn test_disconnect_releases_the_connection() {
        let daemon = FakeDaemon::start();
        let driver = connect(&daemon);
        driver.disconnect();
        assert!(lock_or_abort(&driver.conn).is_none());

        // The next call silently opens a fresh connection.
        driver
            .attach("c1", Pid::from_raw(99))
            .expect("attach after disconnect");
    }
}
