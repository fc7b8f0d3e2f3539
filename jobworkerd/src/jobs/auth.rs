/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use std::fmt::{Display, Formatter};
use thiserror::Error;
use tonic::Request;
use x509_parser::prelude::FromDer;

/// Subject OU value granting full access.
pub const ADMIN_OU: &str = "admin";
/// Subject OU value granting read-only access.
pub const VIEWER_OU: &str = "viewer";

/// The caller's role, taken from the organizational unit of the verified
/// client certificate's subject. mTLS termination has already proven the
/// certificate chains to our CA; this is authorization, not authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => f.write_str(ADMIN_OU),
            Role::Viewer => f.write_str(VIEWER_OU),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no verified client certificate on the connection")]
    MissingPeerCertificate,
    #[error("client certificate could not be parsed")]
    UnparseableCertificate,
    #[error("client certificate subject carries no organizational unit")]
    MissingOrganizationalUnit,
    #[error("organizational unit '{ou}' maps to no role")]
    UnknownRole { ou: String },
    #[error("role '{role}' may not call this operation")]
    ReadOnlyRole { role: Role },
}

/// Extracts the caller's role from the verified peer certificate and, for
/// mutating operations, requires a role with write access.
pub fn authorize<T>(
    request: &Request<T>,
    write: bool,
) -> Result<Role, AuthError> {
    let role = peer_role(request)?;

    if write && !role.can_write() {
        return Err(AuthError::ReadOnlyRole { role });
    }

    Ok(role)
}

fn peer_role<T>(request: &Request<T>) -> Result<Role, AuthError> {
    let certs =
        request.peer_certs().ok_or(AuthError::MissingPeerCertificate)?;
    let cert = certs.first().ok_or(AuthError::MissingPeerCertificate)?;

    let (_, cert) =
        x509_parser::certificate::X509Certificate::from_der(cert.as_ref())
            .map_err(|_| AuthError::UnparseableCertificate)?;

    let ou = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or(AuthError::MissingOrganizationalUnit)?;

    role_for_ou(ou)
}

fn role_for_ou(ou: &str) -> Result<Role, AuthError> {
    match ou {
        ADMIN_OU => Ok(Role::Admin),
        VIEWER_OU => Ok(Role::Viewer),
        other => Err(AuthError::UnknownRole { ou: other.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_for_ou() {
        assert_eq!(role_for_ou("admin").expect("admin role"), Role::Admin);
        assert_eq!(role_for_ou("viewer").expect("viewer role"), Role::Viewer);
        assert!(matches!(
            role_for_ou("ops"),
            Err(AuthError::UnknownRole { ou }) if ou == "ops"
        ));
        // Case sensitive by design: the CA issues lowercase OUs.
        assert!(role_for_ou("Admin").is_err());
    }

    #[test]
    fn test_write_access() {
        assert!(Role::Admin.can_write());
        assert!(!Role::Viewer.can_write());
    }

    #[test]
    fn test_request_without_tls_is_rejected() {
        // A bare request never carries peer certificates.
        let request = Request::new(());
        assert!(matches!(
            authorize(&request, false),
            Err(AuthError::MissingPeerCertificate)
        ));
        assert!(matches!(
            authorize(&request, true),
            Err(AuthError::MissingPeerCertificate)
        ));
    }
}
