//! Container and VM identity resolution.
//!
//! Container ids and pod UIDs are recovered from `/proc/<pid>/cgroup`
//! paths; virtual machines are recognized by their hypervisor process.

use regex::Regex;

use super::VmRef;

/// Identity extracted from a cgroup path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupIdentity {
    /// `(container id, runtime)`.
    pub container: Option<(String, String)>,
    /// Kubernetes pod UID, dashes restored.
    pub pod_uid: Option<String>,
}

/// Parses cgroup paths produced by the common container runtimes, under
/// both the systemd and the cgroupfs drivers.
pub struct CgroupResolver {
    scope_re: Regex,
    plain_docker_re: Regex,
    kubepods_slice_re: Regex,
    kubepods_plain_re: Regex,
}

impl CgroupResolver {
    pub fn new() -> CgroupResolver {
        CgroupResolver {
            // docker-<id>.scope, cri-containerd-<id>.scope, crio-<id>.scope, libpod-<id>.scope
            scope_re: Regex::new(r"(docker|cri-containerd|crio|libpod)-([0-9a-f]{64})\.scope").unwrap(),
            // cgroupfs driver: /docker/<id>, /kubepods/.../<id>
            plain_docker_re: Regex::new(r"/(docker|podman)/([0-9a-f]{64})").unwrap(),
            // systemd driver: kubepods-besteffort-pod<uid with underscores>.slice
            kubepods_slice_re: Regex::new(r"kubepods[^/]*-pod([0-9a-f_]{36})\.slice").unwrap(),
            // cgroupfs driver: /kubepods/burstable/pod<uid>/
            kubepods_plain_re: Regex::new(r"/kubepods[^/]*/(?:[^/]+/)?pod([0-9a-f-]{36})").unwrap(),
        }
    }

    pub fn parse(&self, cgroup_path: &str) -> CgroupIdentity {
        let mut identity = CgroupIdentity::default();

        if let Some(caps) = self.scope_re.captures(cgroup_path) {
            let runtime = match &caps[1] {
                "cri-containerd" => "containerd",
                "libpod" => "podman",
                other => other,
            };
            identity.container = Some((caps[2].to_owned(), runtime.to_owned()));
        } else if let Some(caps) = self.plain_docker_re.captures(cgroup_path) {
            identity.container = Some((caps[2].to_owned(), caps[1].to_owned()));
        } else if let Some(caps) = self.kubepods_plain_re.captures(cgroup_path) {
            // cgroupfs kubepods paths end with the bare container id
            if let Some(id) = cgroup_path
                .rsplit('/')
                .find(|seg| seg.len() == 64 && seg.bytes().all(|b| b.is_ascii_hexdigit()))
            {
                identity.container = Some((id.to_owned(), "containerd".to_owned()));
            }
            identity.pod_uid = Some(caps[1].to_owned());
        }

        if identity.pod_uid.is_none() {
            if let Some(caps) = self.kubepods_slice_re.captures(cgroup_path) {
                identity.pod_uid = Some(caps[1].replace('_', "-"));
            } else if let Some(caps) = self.kubepods_plain_re.captures(cgroup_path) {
                identity.pod_uid = Some(caps[1].to_owned());
            }
        }

        identity
    }
}

impl Default for CgroupResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Recognizes a hypervisor process and extracts the VM identity.
///
/// QEMU is identified by its command name; the VM id comes from the
/// `-uuid` argument and the display name from `-name guest=…`, falling
/// back to the pid when neither is present.
pub fn vm_from_process(pid: i32, comm: &str, cmdline: &[String]) -> Option<VmRef> {
    let is_qemu = comm.starts_with("qemu-system") || comm == "qemu-kvm" || comm == "cloud-hypervisor";
    if !is_qemu {
        return None;
    }

    let mut uuid = None;
    let mut name = None;
    let mut args = cmdline.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-uuid" => uuid = args.next().cloned(),
            "-name" => {
                if let Some(value) = args.next() {
                    // `-name guest=<name>,debug-threads=on` or a bare name
                    let guest = value
                        .split(',')
                        .find_map(|part| part.strip_prefix("guest="))
                        .unwrap_or(value.as_str());
                    name = Some(guest.to_owned());
                }
            }
            _ => {}
        }
    }

    let id = uuid.unwrap_or_else(|| format!("vm-{pid}"));
    let name = name.unwrap_or_else(|| id.clone());
    let hypervisor = if comm == "cloud-hypervisor" { "cloud-hypervisor" } else { "kvm" };
    Some(VmRef {
        id,
        name,
        hypervisor: hypervisor.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn parses_systemd_containerd_scope() {
        let resolver = CgroupResolver::new();
        let path = format!(
            "/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod11111111_2222_3333_4444_555555555555.slice/cri-containerd-{CID}.scope"
        );
        let id = resolver.parse(&path);
        assert_eq!(id.container, Some((CID.to_owned(), "containerd".to_owned())));
        assert_eq!(id.pod_uid.as_deref(), Some("11111111-2222-3333-4444-555555555555"));
    }

    #[test]
    fn parses_plain_docker() {
        let resolver = CgroupResolver::new();
        let id = resolver.parse(&format!("/docker/{CID}"));
        assert_eq!(id.container, Some((CID.to_owned(), "docker".to_owned())));
        assert_eq!(id.pod_uid, None);
    }

    #[test]
    fn parses_cgroupfs_kubepods() {
        let resolver = CgroupResolver::new();
        let path = format!("/kubepods/besteffort/pod11111111-2222-3333-4444-555555555555/{CID}");
        let id = resolver.parse(&path);
        assert_eq!(id.container, Some((CID.to_owned(), "containerd".to_owned())));
        assert_eq!(id.pod_uid.as_deref(), Some("11111111-2222-3333-4444-555555555555"));
    }

    #[test]
    fn ignores_system_services() {
        let resolver = CgroupResolver::new();
        assert_eq!(resolver.parse("/system.slice/sshd.service"), CgroupIdentity::default());
    }

    #[test]
    fn recognizes_qemu() {
        let cmdline: Vec<String> = [
            "qemu-system-x86_64",
            "-name",
            "guest=web-vm,debug-threads=on",
            "-uuid",
            "9f7ab1c2-0000-1111-2222-333344445555",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let vm = vm_from_process(4242, "qemu-system-x86", &cmdline).unwrap();
        assert_eq!(vm.id, "9f7ab1c2-0000-1111-2222-333344445555");
        assert_eq!(vm.name, "web-vm");
        assert_eq!(vm.hypervisor, "kvm");
        assert!(vm_from_process(1, "bash", &[]).is_none());
    }
}
