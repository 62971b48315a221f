//! Host capabilities - computed once at startup and handed to every supervisor.

use std::path::{Path, PathBuf};

use glob::glob;
use serde::Serialize;

/// JVM flags applied to every launch; `-Xmx/-Xms` are prepended per instance.
pub const JVM_BASELINE: &[&str] = &[
    "-XX:+UnlockExperimentalVMOptions",
    "-XX:+UnlockDiagnosticVMOptions",
    "-XX:+AlwaysPreTouch",
    "-XX:+DisableExplicitGC",
    "-XX:+UseNUMA",
    "-XX:NmethodSweepActivity=1",
    "-XX:ReservedCodeCacheSize=400M",
    "-XX:NonNMethodCodeHeapSize=12M",
    "-XX:ProfiledCodeHeapSize=194M",
    "-XX:NonProfiledCodeHeapSize=194M",
    "-XX:-DontCompileHugeMethods",
    "-XX:MaxNodeLimit=240000",
    "-XX:NodeLimitFudgeFactor=8000",
    "-XX:+UseVectorCmov",
    "-XX:+PerfDisableSharedMem",
    "-XX:+UseFastUnorderedTimeStamps",
    "-XX:+UseCriticalJavaThreadPriority",
    "-XX:ThreadPriorityPolicy=1",
    "-XX:AllocatePrefetchStyle=3",
    "-XX:+UseG1GC",
    "-XX:MaxGCPauseMillis=37",
    "-XX:G1HeapRegionSize=16M",
    "-XX:G1NewSizePercent=23",
    "-XX:G1ReservePercent=20",
    "-XX:SurvivorRatio=32",
    "-XX:G1MixedGCCountTarget=3",
    "-XX:G1HeapWastePercent=20",
    "-XX:InitiatingHeapOccupancyPercent=10",
    "-XX:G1RSetUpdatingPauseTimePercent=0",
    "-XX:MaxTenuringThreshold=1",
    "-XX:G1SATBBufferEnqueueingThresholdPercent=30",
    "-XX:G1ConcMarkStepDurationMillis=5.0",
    "-XX:GCTimeRatio=99",
];

/// Large pages need elevated privileges.
pub const LARGE_PAGE_FLAGS: &[&str] = &["-XX:+UseLargePages", "-XX:LargePageSizeInBytes=2m"];

#[cfg(target_os = "windows")]
const JAVA_BIN: &str = "java.exe";
#[cfg(not(target_os = "windows"))]
const JAVA_BIN: &str = "java";

#[derive(Debug, Clone, Serialize)]
pub struct HostCapabilities {
    pub admin: bool,
    pub java_path: PathBuf,
}

impl HostCapabilities {
    pub fn new(admin: bool, java_path: impl Into<PathBuf>) -> Self {
        Self {
            admin,
            java_path: java_path.into(),
        }
    }

    /// Probe the host: privilege level and java location.
    pub fn detect(configured_java: Option<&Path>) -> Self {
        let admin = is_admin();
        let java_path = detect_java(configured_java);
        tracing::info!(
            "Host capabilities: admin={}, java={}",
            admin,
            java_path.display()
        );
        if admin {
            tracing::info!("Enabling large pages because we are running as admin");
        }
        Self { admin, java_path }
    }

    /// Java for one instance: a per-instance override wins when it exists on disk.
    pub fn java_for(&self, instance_override: Option<&str>) -> PathBuf {
        match instance_override.map(PathBuf::from) {
            Some(path) if path.exists() => path,
            Some(path) => {
                tracing::warn!(
                    "Configured java_path '{}' does not exist, using {}",
                    path.display(),
                    self.java_path.display()
                );
                self.java_path.clone()
            }
            None => self.java_path.clone(),
        }
    }

    /// Full argument list after the java executable.
    pub fn launch_args(&self, memory_mb: u64, jar: &Path) -> Vec<String> {
        let mut args = Vec::with_capacity(JVM_BASELINE.len() + 8);
        args.push(format!("-Xmx{}M", memory_mb));
        args.push(format!("-Xms{}M", memory_mb));
        args.extend(JVM_BASELINE.iter().map(|s| s.to_string()));
        if self.admin {
            args.extend(LARGE_PAGE_FLAGS.iter().map(|s| s.to_string()));
        }
        args.push("-jar".to_string());
        args.push(jar.to_string_lossy().replace('\\', "/"));
        args.push("nogui".to_string());
        args
    }
}

#[cfg(unix)]
fn is_admin() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(target_os = "windows")]
fn is_admin() -> bool {
    use std::mem;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::GetTokenInformation;
    use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};

    unsafe {
        let mut token: HANDLE = std::ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }
        let mut elevation: TOKEN_ELEVATION = mem::zeroed();
        let mut size = 0u32;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut size,
        );
        CloseHandle(token);
        ok != 0 && elevation.TokenIsElevated != 0
    }
}

#[cfg(not(any(unix, target_os = "windows")))]
fn is_admin() -> bool {
    false
}

/// config → $JAVA_HOME → well-known JDK install dirs → `java` on PATH
fn detect_java(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        if path.exists() {
            return path.to_path_buf();
        }
        tracing::warn!("Configured java '{}' not found, probing", path.display());
    }

    if let Some(home) = std::env::var_os("JAVA_HOME") {
        let candidate = PathBuf::from(home).join("bin").join(JAVA_BIN);
        if candidate.exists() {
            return candidate;
        }
    }

    for pattern in default_jdk_globs() {
        let Ok(paths) = glob(&pattern) else {
            continue;
        };
        // 버전이 높은 JDK가 뒤에 오므로 역순
        let mut found: Vec<PathBuf> = paths.flatten().filter(|p| p.is_file()).collect();
        found.sort();
        if let Some(path) = found.pop() {
            tracing::debug!("Found java at {}", path.display());
            return path;
        }
    }

    PathBuf::from(JAVA_BIN)
}

/// 플랫폼별 JDK 설치 위치 (glob 패턴)
fn default_jdk_globs() -> Vec<String> {
    let mut patterns = Vec::new();

    #[cfg(target_os = "windows")]
    {
        for var in ["ProgramFiles", "ProgramFiles(x86)"] {
            if let Some(dir) = std::env::var_os(var) {
                let dir = PathBuf::from(dir);
                for vendor in ["Java", "Eclipse Adoptium", "Eclipse Foundation", "AdoptOpenJDK", "BellSoft/LibericaJDK"] {
                    patterns.push(dir.join(vendor).join("*").join("bin").join(JAVA_BIN).to_string_lossy().to_string());
                }
            }
        }
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            let local = PathBuf::from(local).join("Programs");
            for vendor in ["Java", "AdoptOpenJDK", "Eclipse Adoptium"] {
                patterns.push(local.join(vendor).join("*").join("bin").join(JAVA_BIN).to_string_lossy().to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        patterns.push("/usr/lib/jvm/*/bin/java".to_string());
        patterns.push("/usr/lib64/jvm/*/bin/java".to_string());
        patterns.push("/opt/java/*/bin/java".to_string());
        if let Some(home) = std::env::var_os("HOME") {
            let home = PathBuf::from(home);
            patterns.push(home.join(".sdkman/candidates/java/*/bin/java").to_string_lossy().to_string());
            patterns.push(home.join(".jdks/*/bin/java").to_string_lossy().to_string());
        }
    }

    #[cfg(target_os = "macos")]
    {
        patterns.push("/Library/Java/JavaVirtualMachines/*/Contents/Home/bin/java".to_string());
        patterns.push("/opt/homebrew/opt/openjdk*/bin/java".to_string());
        if let Some(home) = std::env::var_os("HOME") {
            let home = PathBuf::from(home);
            patterns.push(home.join(".sdkman/candidates/java/*/bin/java").to_string_lossy().to_string());
        }
    }

    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_args_shape() {
        let host = HostCapabilities::new(false, "java");
        let args = host.launch_args(2048, Path::new("/srv/mc/paper-1.20.4.jar"));
        assert_eq!(args[0], "-Xmx2048M");
        assert_eq!(args[1], "-Xms2048M");
        assert!(args.contains(&"-XX:+UseG1GC".to_string()));
        assert!(!args.contains(&"-XX:+UseLargePages".to_string()));
        let tail = &args[args.len() - 3..];
        assert_eq!(tail, ["-jar", "/srv/mc/paper-1.20.4.jar", "nogui"]);
    }

    #[test]
    fn test_admin_adds_large_pages() {
        let host = HostCapabilities::new(true, "java");
        let args = host.launch_args(1024, Path::new("server.jar"));
        let pos = args.iter().position(|a| a == "-XX:+UseLargePages").unwrap();
        assert_eq!(args[pos + 1], "-XX:LargePageSizeInBytes=2m");
        assert!(pos < args.iter().position(|a| a == "-jar").unwrap());
    }

    #[test]
    fn test_configured_java_wins() {
        let dir = tempfile::tempdir().unwrap();
        let java = dir.path().join("java");
        std::fs::write(&java, "").unwrap();
        assert_eq!(detect_java(Some(&java)), java);
    }

    #[test]
    fn test_instance_override() {
        let dir = tempfile::tempdir().unwrap();
        let java = dir.path().join("java17");
        std::fs::write(&java, "").unwrap();
        let host = HostCapabilities::new(false, "java");

        assert_eq!(host.java_for(java.to_str()), java);
        assert_eq!(host.java_for(Some("/no/such/java")), PathBuf::from("java"));
        assert_eq!(host.java_for(None), PathBuf::from("java"));
    }
}
