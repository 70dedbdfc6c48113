//! Package management enumerations as transmitted over the bus.
//!
//! Values arrive as integer indices; an out-of-range index maps to the
//! first (unknown) variant.

macro_rules! indexed_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $desc:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn from_index(index: u32) -> Self {
                Self::ALL
                    .get(index as usize)
                    .copied()
                    .unwrap_or(Self::ALL[0])
            }

            pub fn index(self) -> u32 {
                self as u32
            }

            pub fn desc(self) -> &'static str {
                match self {
                    $($name::$variant => $desc),+
                }
            }
        }
    };
}

indexed_enum!(Role {
    Unknown => "Unknown",
    Cancel => "Cancel",
    DependsOn => "Depends On",
    GetDetails => "Get Details",
    GetFiles => "Get Files",
    GetPackages => "Get Packages",
    GetRepoList => "Get Repo List",
    RequiredBy => "Required By",
    GetUpdateDetail => "Get Update Detail",
    GetUpdates => "Get Updates",
    InstallFiles => "Install Files",
    InstallPackages => "Install Packages",
    InstallSignature => "Install Signature",
    RefreshCache => "Refresh Cache",
    RemovePackages => "Remove Packages",
    RepoEnable => "Repo Enable",
    RepoSetData => "Repo Set Data",
    Resolve => "Resolve",
    SearchDetails => "Search Details",
    SearchFile => "Search File",
    SearchGroup => "Search Group",
    SearchName => "Search Name",
    UpdatePackages => "Update Packages",
    WhatProvides => "What Provides",
    AcceptEula => "Accept EULA",
    DownloadPackages => "Download Packages",
    GetDistroUpgrades => "Get Distro Upgrades",
    GetCategories => "Get Categories",
    GetOldTransactions => "Get Old Transactions",
    RepairSystem => "Repair System",
    GetDetailsLocal => "Get Details Local",
    GetFilesLocal => "Get Files Local",
    RepoRemove => "Repo Remove",
    UpgradeSystem => "Upgrade System",
});

impl Role {
    /// Roles whose package signals are collected as the result.
    pub fn collects_packages(self) -> bool {
        matches!(self, Role::Resolve | Role::GetPackages | Role::GetUpdates)
    }

    /// Roles that never narrate progress.
    pub fn is_query(self) -> bool {
        self.collects_packages() || self == Role::GetRepoList
    }
}

indexed_enum!(Status {
    Unknown => "Unknown",
    Wait => "Waiting",
    Setup => "Setup",
    Running => "Running",
    Query => "Querying",
    Info => "Getting Information",
    Remove => "Removing",
    RefreshCache => "Refreshing Cache",
    Download => "Downloading",
    Install => "Installing",
    Update => "Updating",
    Cleanup => "Cleaning Up",
    Obsolete => "Obsoleting",
    DepResolve => "Resolving Dependencies",
    SigCheck => "Checking Signatures",
    TestCommit => "Testing Changes",
    Commit => "Committing Changes",
    Request => "Requesting Data",
    Finished => "Finished",
    Cancel => "Cancelling",
    DownloadRepository => "Downloading Repository",
    DownloadPackagelist => "Downloading Package List",
    DownloadFilelist => "Downloading File List",
    DownloadChangelog => "Downloading Changelog",
    DownloadGroup => "Downloading Group",
    DownloadUpdateinfo => "Downloading Update Info",
    Repackaging => "Repackaging",
    LoadingCache => "Loading Cache",
    ScanApplications => "Scanning Applications",
    GeneratePackageList => "Generating Package List",
    WaitingForLock => "Waiting For Lock",
    WaitingForAuth => "Waiting For Authentication",
    ScanProcessList => "Scanning Process List",
    CheckExecutableFiles => "Checking Executable Files",
    CheckLibraries => "Checking Libraries",
    CopyFiles => "Copying Files",
    RunHook => "Running Hook",
});

impl Status {
    /// Statuses during which percentage changes are narrated.
    pub fn reports_progress(self) -> bool {
        matches!(self, Status::Running | Status::Install | Status::Update)
    }
}

indexed_enum!(Exit {
    Unknown => "Unknown",
    Success => "Success",
    Failed => "Failed",
    Cancelled => "Cancelled",
    KeyRequired => "Key Required",
    EulaRequired => "EULA Required",
    Killed => "Killed",
    MediaChangeRequired => "Media Change Required",
    NeedUntrusted => "Need Untrusted",
    CancelledPriority => "Cancelled Priority",
    SkipTransaction => "Skip Transaction",
    RepairRequired => "Repair Required",
});

indexed_enum!(Info {
    Unknown => "Unknown",
    Installed => "Installed",
    Available => "Available",
    Low => "Low",
    Enhancement => "Enhancement",
    Normal => "Normal",
    Bugfix => "Bugfix",
    Important => "Important",
    Security => "Security",
    Blocked => "Blocked",
    Downloading => "Downloading",
    Updating => "Updating",
    Installing => "Installing",
    Removing => "Removing",
    Cleanup => "Cleanup",
    Obsoleting => "Obsoleting",
    CollectionInstalled => "Collection Installed",
    CollectionAvailable => "Collection Available",
    Finished => "Finished",
    Reinstalling => "Reinstalling",
    Downgrading => "Downgrading",
    Preparing => "Preparing",
    Decompressing => "Decompressing",
    Untrusted => "Untrusted",
    Trusted => "Trusted",
    Unavailable => "Unavailable",
    Critical => "Critical",
});

indexed_enum!(Error {
    Unknown => "UNKNOWN",
    Oom => "OOM",
    NoNetwork => "NO_NETWORK",
    NotSupported => "NOT_SUPPORTED",
    InternalError => "INTERNAL_ERROR",
    GpgFailure => "GPG_FAILURE",
    PackageIdInvalid => "PACKAGE_ID_INVALID",
    PackageNotInstalled => "PACKAGE_NOT_INSTALLED",
    PackageNotFound => "PACKAGE_NOT_FOUND",
    PackageAlreadyInstalled => "PACKAGE_ALREADY_INSTALLED",
    PackageDownloadFailed => "PACKAGE_DOWNLOAD_FAILED",
    GroupNotFound => "GROUP_NOT_FOUND",
    GroupListInvalid => "GROUP_LIST_INVALID",
    DepResolutionFailed => "DEP_RESOLUTION_FAILED",
    FilterInvalid => "FILTER_INVALID",
    CreateThreadFailed => "CREATE_THREAD_FAILED",
    TransactionError => "TRANSACTION_ERROR",
    TransactionCancelled => "TRANSACTION_CANCELLED",
    NoCache => "NO_CACHE",
    RepoNotFound => "REPO_NOT_FOUND",
    CannotRemoveSystemPackage => "CANNOT_REMOVE_SYSTEM_PACKAGE",
    ProcessKill => "PROCESS_KILL",
    FailedInitialization => "FAILED_INITIALIZATION",
    FailedFinalise => "FAILED_FINALISE",
    FailedConfigParsing => "FAILED_CONFIG_PARSING",
    CannotCancel => "CANNOT_CANCEL",
    CannotGetLock => "CANNOT_GET_LOCK",
    NoPackagesToUpdate => "NO_PACKAGES_TO_UPDATE",
    CannotWriteRepoConfig => "CANNOT_WRITE_REPO_CONFIG",
    LocalInstallFailed => "LOCAL_INSTALL_FAILED",
    BadGpgSignature => "BAD_GPG_SIGNATURE",
    MissingGpgSignature => "MISSING_GPG_SIGNATURE",
    CannotInstallSourcePackage => "CANNOT_INSTALL_SOURCE_PACKAGE",
    RepoConfigurationError => "REPO_CONFIGURATION_ERROR",
    NoLicenseAgreement => "NO_LICENSE_AGREEMENT",
    FileConflicts => "FILE_CONFLICTS",
    PackageConflicts => "PACKAGE_CONFLICTS",
    RepoNotAvailable => "REPO_NOT_AVAILABLE",
    InvalidPackageFile => "INVALID_PACKAGE_FILE",
    PackageInstallBlocked => "PACKAGE_INSTALL_BLOCKED",
    PackageCorrupt => "PACKAGE_CORRUPT",
    AllPackagesAlreadyInstalled => "ALL_PACKAGES_ALREADY_INSTALLED",
    FileNotFound => "FILE_NOT_FOUND",
    NoMoreMirrorsToTry => "NO_MORE_MIRRORS_TO_TRY",
    NoDistroUpgradeData => "NO_DISTRO_UPGRADE_DATA",
    IncompatibleArchitecture => "INCOMPATIBLE_ARCHITECTURE",
    NoSpaceOnDevice => "NO_SPACE_ON_DEVICE",
    MediaChangeRequired => "MEDIA_CHANGE_REQUIRED",
    NotAuthorized => "NOT_AUTHORIZED",
    UpdateNotFound => "UPDATE_NOT_FOUND",
    CannotInstallRepoUnsigned => "CANNOT_INSTALL_REPO_UNSIGNED",
    CannotUpdateRepoUnsigned => "CANNOT_UPDATE_REPO_UNSIGNED",
    CannotGetFilelist => "CANNOT_GET_FILELIST",
    CannotGetRequires => "CANNOT_GET_REQUIRES",
    CannotDisableRepository => "CANNOT_DISABLE_REPOSITORY",
    RestrictedDownload => "RESTRICTED_DOWNLOAD",
    PackageFailedToConfigure => "PACKAGE_FAILED_TO_CONFIGURE",
    PackageFailedToBuild => "PACKAGE_FAILED_TO_BUILD",
    PackageFailedToInstall => "PACKAGE_FAILED_TO_INSTALL",
    PackageFailedToRemove => "PACKAGE_FAILED_TO_REMOVE",
    UpdateFailedDueToRunningProcess => "UPDATE_FAILED_DUE_TO_RUNNING_PROCESS",
    PackageDatabaseChanged => "PACKAGE_DATABASE_CHANGED",
    ProvideTypeNotSupported => "PROVIDE_TYPE_NOT_SUPPORTED",
    InstallRootInvalid => "INSTALL_ROOT_INVALID",
    CannotFetchSources => "CANNOT_FETCH_SOURCES",
    CancelledPriority => "CANCELLED_PRIORITY",
    UnfinishedTransaction => "UNFINISHED_TRANSACTION",
    LockRequired => "LOCK_REQUIRED",
    RepoAlreadySet => "REPO_ALREADY_SET",
});

/// Query filter bits.
pub mod filter {
    pub const NONE: u64 = 1 << 1;
    pub const NOT_INSTALLED: u64 = 1 << 3;
    pub const BASENAME: u64 = 1 << 14;
    pub const NEWEST: u64 = 1 << 16;
    pub const ARCH: u64 = 1 << 18;
}

/// Transaction flag bits.
pub mod transaction_flag {
    pub const NONE: u64 = 0;
    pub const ONLY_TRUSTED: u64 = 1 << 1;
}
