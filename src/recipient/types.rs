//! Recipient records shared with the rest of the application.

use crate::discovery::{Aci, Pni, E164};

/// A locally known account or phone number.
///
/// Discovery merges into recipients and flags them, but never deletes
/// them or replaces them wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Recipient {
    /// Store-assigned row ID.
    pub id: i64,
    /// Account identifier, if known.
    pub aci: Option<Aci>,
    /// Phone-number identifier, if known.
    pub pni: Option<Pni>,
    /// Phone number, if known.
    pub phone_number: Option<E164>,
    /// Whether the directory service currently reveals this phone number.
    pub is_phone_number_discoverable: bool,
    /// Whether the account is believed to be registered.
    pub is_registered: bool,
}

impl Recipient {
    /// Creates an unsaved recipient known only by phone number.
    #[must_use]
    pub const fn with_phone_number(phone_number: E164) -> Self {
        Self {
            id: 0,
            aci: None,
            pni: None,
            phone_number: Some(phone_number),
            is_phone_number_discoverable: false,
            is_registered: false,
        }
    }

    /// Sets the ACI.
    #[must_use]
    pub const fn with_aci(mut self, aci: Aci) -> Self {
        self.aci = Some(aci);
        self
    }

    /// Sets the PNI.
    #[must_use]
    pub const fn with_pni(mut self, pni: Pni) -> Self {
        self.pni = Some(pni);
        self
    }

    /// Sets the registration flag.
    #[must_use]
    pub const fn registered(mut self, is_registered: bool) -> Self {
        self.is_registered = is_registered;
        self
    }

    /// Returns whether the recipient has any stable service identifier.
    #[must_use]
    pub const fn has_service_id(&self) -> bool {
        self.aci.is_some() || self.pni.is_some()
    }
}
