use dashmap::DashMap;
use ovs_arakoon::Operation;
use uuid::Uuid;

use crate::{Error, TransactionId};

/// Operations staged per transaction, waiting to be applied as one sequence.
#[derive(Debug, Default)]
pub(crate) struct Transactions {
    staged: DashMap<TransactionId, Vec<Operation>>,
}

impl Transactions {
    pub(crate) fn begin(&self) -> TransactionId {
        let id = Uuid::new_v4();
        self.staged.insert(id, Vec::new());
        id
    }

    pub(crate) fn stage(&self, id: TransactionId, operation: Operation) -> Result<(), Error> {
        self.staged
            .get_mut(&id)
            .ok_or(Error::UnknownTransaction(id))?
            .push(operation);
        Ok(())
    }

    pub(crate) fn take(&self, id: TransactionId) -> Result<Vec<Operation>, Error> {
        self.staged
            .remove(&id)
            .map(|(_, operations)| operations)
            .ok_or(Error::UnknownTransaction(id))
    }

    pub(crate) fn discard(&self, id: TransactionId) {
        self.staged.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.staged.len()
    }
}
