/// Router Module Index
///
/// Splits the portal's endpoints by the capability they require. The route gate in
/// front of the whole router enforces the capability; public reads never pay for a
/// role lookup.

/// Routes open to every visitor.
pub mod public;

/// Routes requiring a signed-in visitor.
pub mod authenticated;

/// Routes requiring the `admin` or `superadmin` role.
pub mod admin;
