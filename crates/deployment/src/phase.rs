use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use kernel_core::KernelError;

/// 部署单元处理周期的各个阶段
///
/// 阶段的先后顺序就是声明顺序，`Ord` 直接派生自声明顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// 挂载部署单元的根结构
    Structure,
    /// 解析部署描述符与注解
    Parse,
    /// 元数据解析完成，组件可以向子系统登记
    Register,
    /// 组装模块依赖
    Dependencies,
    ConfigureModule,
    /// 部署类加载器首次被使用之前
    FirstModuleUse,
    PostModule,
    Install,
    Cleanup,
}

const ALL_PHASES: [Phase; 9] = [
    Phase::Structure,
    Phase::Parse,
    Phase::Register,
    Phase::Dependencies,
    Phase::ConfigureModule,
    Phase::FirstModuleUse,
    Phase::PostModule,
    Phase::Install,
    Phase::Cleanup,
];

impl Phase {
    /// 按声明顺序返回全部阶段
    pub fn all() -> &'static [Phase] {
        &ALL_PHASES
    }

    /// 下一个阶段，最后一个阶段返回 `None`
    pub fn next(self) -> Option<Phase> {
        ALL_PHASES.get(self as usize + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Structure => "STRUCTURE",
            Phase::Parse => "PARSE",
            Phase::Register => "REGISTER",
            Phase::Dependencies => "DEPENDENCIES",
            Phase::ConfigureModule => "CONFIGURE_MODULE",
            Phase::FirstModuleUse => "FIRST_MODULE_USE",
            Phase::PostModule => "POST_MODULE",
            Phase::Install => "INSTALL",
            Phase::Cleanup => "CLEANUP",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_PHASES
            .iter()
            .copied()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| KernelError::UnknownPhase(s.to_string()))
    }
}

/// 各阶段内常用的处理器优先级
pub mod priority {
    // STRUCTURE
    pub const STRUCTURE_EXPLODED_MOUNT: u32 = 0x0100;
    pub const STRUCTURE_MOUNT: u32 = 0x0200;
    pub const STRUCTURE_MANIFEST: u32 = 0x0300;
    pub const STRUCTURE_JDBC_DRIVER: u32 = 0x0600;
    pub const STRUCTURE_WAR: u32 = 0x0900;
    pub const STRUCTURE_EAR: u32 = 0x0E00;
    pub const STRUCTURE_SERVICE_MODULE_LOADER: u32 = 0x1000;
    pub const STRUCTURE_ANNOTATION_INDEX: u32 = 0x1100;
    pub const STRUCTURE_SUB_DEPLOYMENT: u32 = 0x1700;
    pub const STRUCTURE_CLASS_PATH: u32 = 0x1900;
    pub const STRUCTURE_GLOBAL_MODULES: u32 = 0x1E00;

    // PARSE
    pub const PARSE_EE_MODULE_NAME: u32 = 0x0100;
    pub const PARSE_DEPENDENCIES_MANIFEST: u32 = 0x0300;
    pub const PARSE_EXTENSION_LIST: u32 = 0x0700;
    pub const PARSE_WEB_DEPLOYMENT: u32 = 0x0B00;
    pub const PARSE_EJB_DEPLOYMENT: u32 = 0x1100;
    pub const PARSE_SERVICE_DEPLOYMENT: u32 = 0x2300;
    pub const PARSE_PERSISTENCE_UNIT: u32 = 0x2F00;

    // DEPENDENCIES
    pub const DEPENDENCIES_EE: u32 = 0x0100;
    pub const DEPENDENCIES_EJB: u32 = 0x0200;
    pub const DEPENDENCIES_MODULE: u32 = 0x0300;
    pub const DEPENDENCIES_NAMING: u32 = 0x0800;

    // CONFIGURE_MODULE
    pub const CONFIGURE_MODULE_SPEC: u32 = 0x0100;

    // POST_MODULE
    pub const POST_MODULE_INJECTION_ANNOTATION: u32 = 0x0100;
    pub const POST_MODULE_EJB_REF: u32 = 0x0500;
    pub const POST_MODULE_NAMING_CONTEXT: u32 = 0x0A00;

    // INSTALL
    pub const INSTALL_JNDI_DEPENDENCIES: u32 = 0x0100;
    pub const INSTALL_SERVICE_DEPLOYMENT: u32 = 0x0B00;
    pub const INSTALL_WAR_DEPLOYMENT: u32 = 0x1D00;
    pub const INSTALL_DEPLOYMENT_COMPLETE_SERVICE: u32 = 0x2000;

    // CLEANUP
    pub const CLEANUP_REFLECTION_INDEX: u32 = 0x0100;
    pub const CLEANUP_ANNOTATION_INDEX: u32 = 0x0200;
}
