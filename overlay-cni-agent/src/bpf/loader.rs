use std::fs;
use std::path::{Path, PathBuf};

use aya::programs::links::{FdLink, LinkError, PinnedLink};
use aya::programs::{SchedClassifier, TcAttachType, tc};
use aya::{Ebpf, EbpfLoader};
use overlay_cni_common::{LXC_MAP_NAME, MAP_MAX_ENTRIES, NODE_LOCAL_MAP_NAME, POD_MAP_NAME};
use tracing::{debug, info, warn};

use crate::bpf::{map_path, maps_pinned, pin_dir};
use crate::{Error, Result};

/// Links are pinned here so the filters outlive the process that attached them.
const LINKS_DIR: &str = "overlay-cni/links";

/// The classifiers shipped next to the plugin, one object file per program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcProgram {
    /// Host end of every pod veth.
    VethIngress,
    VxlanIngress,
    VxlanEgress,
}

impl TcProgram {
    pub const ALL: [TcProgram; 3] = [
        TcProgram::VethIngress,
        TcProgram::VxlanIngress,
        TcProgram::VxlanEgress,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TcProgram::VethIngress => "veth_ingress",
            TcProgram::VxlanIngress => "vxlan_ingress",
            TcProgram::VxlanEgress => "vxlan_egress",
        }
    }

    pub fn attach_type(&self) -> TcAttachType {
        match self {
            TcProgram::VethIngress | TcProgram::VxlanIngress => TcAttachType::Ingress,
            TcProgram::VxlanEgress => TcAttachType::Egress,
        }
    }

    fn direction(&self) -> &'static str {
        match self.attach_type() {
            TcAttachType::Ingress => "ingress",
            TcAttachType::Egress => "egress",
            TcAttachType::Custom(_) => "custom",
        }
    }
}

/// Loads the tc objects against the pinned maps and attaches them.
#[derive(Clone, Debug)]
pub struct TcObjects {
    dir: PathBuf,
    bpf_fs: PathBuf,
    max_entries: u32,
}

impl TcObjects {
    pub fn new(dir: impl Into<PathBuf>, bpf_fs: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            bpf_fs: bpf_fs.into(),
            max_entries: MAP_MAX_ENTRIES,
        }
    }

    /// Size of each shared map. Only takes effect when the maps are created.
    pub fn with_max_entries(mut self, max_entries: u32) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn bpf_fs(&self) -> &Path {
        &self.bpf_fs
    }

    pub fn object_path(&self, program: TcProgram) -> PathBuf {
        self.dir.join(format!("{}.o", program.name()))
    }

    pub fn link_path(&self, program: TcProgram, iface: &str) -> PathBuf {
        self.bpf_fs
            .join(LINKS_DIR)
            .join(format!("{}_{}_{}", program.name(), iface, program.direction()))
    }

    /// Maps declared by an object are created and pinned the first time it is
    /// loaded, and reused from the pin afterwards.
    fn load(&self, program: TcProgram) -> Result<Ebpf> {
        let pins = pin_dir(&self.bpf_fs);
        fs::create_dir_all(&pins)?;
        let object = self.object_path(program);
        debug!("loading {} with maps pinned at {}", object.display(), pins.display());
        let mut loader = EbpfLoader::new();
        loader.map_pin_path(&pins);
        for name in [LXC_MAP_NAME, POD_MAP_NAME, NODE_LOCAL_MAP_NAME] {
            loader.set_max_entries(name, self.max_entries);
        }
        let mut ebpf = loader.load_file(&object)?;
        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!(%e, "failed to init ebpf logger");
        }
        Ok(ebpf)
    }

    /// Makes sure the lxc, pod and node local maps exist on the bpf fs.
    pub fn ensure_maps(&self) -> Result<()> {
        if maps_pinned(&self.bpf_fs) {
            return Ok(());
        }
        for program in TcProgram::ALL {
            self.load(program)?;
        }
        for name in [LXC_MAP_NAME, POD_MAP_NAME, NODE_LOCAL_MAP_NAME] {
            if !map_path(&self.bpf_fs, name).exists() {
                return Err(Error::MapNotFound { name: name.into() });
            }
        }
        info!("pinned maps created under {}", pin_dir(&self.bpf_fs).display());
        Ok(())
    }

    /// Attaches `program` to `iface` unless an earlier call already did.
    pub fn attach(&self, program: TcProgram, iface: &str) -> Result<()> {
        let link_path = self.link_path(program, iface);
        if link_path.exists() {
            debug!("{} already attached to {}", program.name(), iface);
            return Ok(());
        }
        // error adding clsact to the interface if it is already added is harmless
        let _ = tc::qdisc_add_clsact(iface);
        // drop filters left behind by an earlier netlink attach
        let _ = tc::qdisc_detach_program(iface, program.attach_type(), program.name());

        let mut ebpf = self.load(program)?;
        let prog: &mut SchedClassifier = ebpf
            .program_mut(program.name())
            .ok_or_else(|| {
                Error::EbpfProgramError(format!("failed to load program {}", program.name()))
            })?
            .try_into()?;
        if let Err(e) = prog.load()
            && !matches!(e, aya::programs::ProgramError::AlreadyLoaded)
        {
            return Err(e.into());
        };
        let link_id = prog.attach(iface, program.attach_type())?;
        let link = prog.take_link(link_id)?;
        match FdLink::try_from(link) {
            Ok(link) => {
                if let Some(parent) = link_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                link.pin(&link_path)?;
            }
            // netlink filters hold their own reference to the program
            Err(LinkError::InvalidLink) => {
                debug!("{} attached to {} through netlink", program.name(), iface);
            }
            Err(e) => return Err(e.into()),
        }
        info!("attached {} to {} {}", program.name(), iface, program.direction());
        Ok(())
    }

    /// Removes a pinned link. A missing link is not an error.
    pub fn detach(&self, program: TcProgram, iface: &str) -> Result<()> {
        let path = self.link_path(program, iface);
        match path.try_exists() {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        match PinnedLink::from_pin(&path) {
            Ok(link) => {
                let _link = link.unpin()?;
            }
            Err(LinkError::SyscallError(err))
                if err.io_error.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
