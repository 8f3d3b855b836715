pub mod init;
pub mod propagate;
pub mod reconcile;
pub mod run;
pub mod status;
pub mod version;

pub use init::Init;
pub use propagate::Propagate;
pub use reconcile::Reconcile;
pub use run::Run;
pub use status::Status;
pub use version::Version;

crate::command_enum! {
    (Init, Init),
    (Run, Run),
    (Propagate, Propagate),
    (Reconcile, Reconcile),
    (Status, Status),
    (Version, Version),
}
