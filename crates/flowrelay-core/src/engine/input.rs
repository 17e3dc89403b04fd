//! Inbound frame processing
//!
//! Applies frames received from the peer to the endpoint arena and posts the
//! matching remote events.

use tracing::{debug, trace, warn};

use super::{
    ConnectionId, DeliveryId, DeliveryRecord, Endpoint, Engine, Event, Frame, LinkId, Performative,
    SessionId,
};
use crate::errors::EngineError;
use crate::types::{DeliveryTag, EndpointState, Outcome, Role, Terminus};
use crate::Result;

impl Engine {
    /// Apply a frame received from the peer on `connection`
    pub fn input(&mut self, connection: ConnectionId, frame: Frame) -> Result<()> {
        self.connection_record(connection)?;
        trace!("Connection {} received {}", connection, frame.name());

        let channel = frame.channel;
        match frame.body {
            Performative::Open { container_id, .. } => {
                let record = self.connection_record_mut(connection)?;
                record.remote = EndpointState::Active;
                record.remote_container_id = Some(container_id);
                self.post(Event::RemoteOpen(Endpoint::Connection(connection)));
            }
            Performative::Close => {
                self.connection_record_mut(connection)?.remote = EndpointState::Closed;
                self.post(Event::RemoteClose(Endpoint::Connection(connection)));
                self.check_final(Endpoint::Connection(connection));
            }
            Performative::Begin { remote_channel } => {
                self.remote_begin(connection, channel, remote_channel)?;
            }
            Performative::End => {
                let session = self.remote_session(connection, channel)?;
                self.connection_record_mut(connection)?
                    .remote_channels
                    .remove(&channel);
                self.session_record_mut(session)?.remote = EndpointState::Closed;
                self.post(Event::RemoteClose(Endpoint::Session(session)));
                self.check_final(Endpoint::Session(session));
            }
            Performative::Attach {
                name,
                handle,
                role,
                source,
                target,
            } => {
                let session = self.remote_session(connection, channel)?;
                self.remote_attach(session, name, handle, role, source, target)?;
            }
            Performative::Flow {
                handle,
                delivery_count,
                link_credit,
                drain,
            } => {
                let link = self.remote_link(connection, channel, handle)?;
                self.remote_flow(link, delivery_count, link_credit, drain)?;
            }
            Performative::Transfer {
                handle,
                delivery_number,
                tag,
                settled,
                more,
                payload,
            } => {
                let link = self.remote_link(connection, channel, handle)?;
                self.remote_transfer(link, delivery_number, tag, settled, more, payload)?;
            }
            Performative::Disposition {
                handle,
                delivery_number,
                settled,
                outcome,
            } => {
                let link = self.remote_link(connection, channel, handle)?;
                self.remote_disposition(link, delivery_number, settled, outcome)?;
            }
            Performative::Detach { handle } => {
                let link = self.remote_link(connection, channel, handle)?;
                let session = self.link_record(link)?.session;
                self.session_record_mut(session)?
                    .remote_handles
                    .remove(&handle);
                self.link_record_mut(link)?.remote = EndpointState::Closed;
                self.post(Event::RemoteClose(Endpoint::Link(link)));
                self.check_final(Endpoint::Link(link));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Peer Handle Resolution
    // ------------------------------------------------------------------------

    fn remote_session(&self, connection: ConnectionId, channel: u16) -> Result<SessionId> {
        self.connection_record(connection)?
            .remote_channels
            .get(&channel)
            .copied()
            .ok_or_else(|| EngineError::UnknownChannel { channel }.into())
    }

    fn remote_link(&self, connection: ConnectionId, channel: u16, handle: u32) -> Result<LinkId> {
        let session = self.remote_session(connection, channel)?;
        self.session_record(session)?
            .remote_handles
            .get(&handle)
            .copied()
            .ok_or_else(|| EngineError::UnknownHandle { channel, handle }.into())
    }

    // ------------------------------------------------------------------------
    // Remote Lifecycle
    // ------------------------------------------------------------------------

    fn remote_begin(
        &mut self,
        connection: ConnectionId,
        channel: u16,
        answered: Option<u16>,
    ) -> Result<()> {
        let session = match answered {
            Some(local_channel) => {
                let record = self.connection_record(connection)?;
                record
                    .sessions
                    .iter()
                    .copied()
                    .find(|s| {
                        self.sessions
                            .get(s)
                            .is_some_and(|r| r.channel == local_channel)
                    })
                    .ok_or(EngineError::UnknownChannel {
                        channel: local_channel,
                    })?
            }
            None => self.session(connection)?,
        };

        self.connection_record_mut(connection)?
            .remote_channels
            .insert(channel, session);
        let record = self.session_record_mut(session)?;
        record.remote_channel = Some(channel);
        record.remote = EndpointState::Active;
        self.post(Event::RemoteOpen(Endpoint::Session(session)));
        Ok(())
    }

    /// Match an attach to a local link of the opposite role with the same name,
    /// creating one when the peer initiated the link
    fn remote_attach(
        &mut self,
        session: SessionId,
        name: String,
        handle: u32,
        role: Role,
        source: Terminus,
        target: Terminus,
    ) -> Result<()> {
        let local_role = role.opposite();
        let existing = self.session_record(session)?.links.iter().copied().find(|l| {
            self.links.get(l).is_some_and(|r| {
                r.name == name && r.role == local_role && r.remote_handle.is_none()
            })
        });
        let link = match existing {
            Some(link) => link,
            None => self.create_link(session, &name, local_role)?,
        };

        self.session_record_mut(session)?
            .remote_handles
            .insert(handle, link);
        let record = self.link_record_mut(link)?;
        record.remote_handle = Some(handle);
        record.remote_source = source;
        record.remote_target = target;
        record.remote = EndpointState::Active;
        debug!("Peer attached {} link {} ({})", role, link, name);
        self.post(Event::RemoteOpen(Endpoint::Link(link)));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Credit and Deliveries
    // ------------------------------------------------------------------------

    fn remote_flow(
        &mut self,
        link: LinkId,
        delivery_count: u32,
        link_credit: u32,
        drain: bool,
    ) -> Result<()> {
        let record = self.link_record_mut(link)?;
        match record.role {
            Role::Sender => {
                let limit = delivery_count.saturating_add(link_credit);
                record.credit = limit.saturating_sub(record.delivery_count);
                record.drain = drain;
            }
            Role::Receiver => {
                let limit = record.delivery_count.saturating_add(record.credit);
                record.credit = limit.saturating_sub(delivery_count);
                record.delivery_count = delivery_count;
                if record.credit == 0 {
                    record.drain = false;
                }
            }
        }
        trace!(
            "Link {} flow: credit={} drain={}",
            link,
            record.credit,
            record.drain
        );
        self.post(Event::Flow(link));
        Ok(())
    }

    fn remote_transfer(
        &mut self,
        link: LinkId,
        number: u32,
        tag: DeliveryTag,
        settled: bool,
        more: bool,
        payload: Vec<u8>,
    ) -> Result<()> {
        let record = self.link_record(link)?;
        if record.role != Role::Receiver {
            return Err(EngineError::Protocol {
                reason: format!("transfer received on sending link {}", link),
            }
            .into());
        }

        let continuing = record
            .current
            .filter(|d| self.deliveries.get(d).is_some_and(|r| r.number == number));
        let delivery = match continuing {
            Some(delivery) => delivery,
            None => self.incoming_delivery(link, number, tag)?,
        };

        let record = self.delivery_record_mut(delivery)?;
        record.buffer.extend_from_slice(&payload);
        record.partial = more;
        record.remote_settled |= settled;
        let locally_settled = record.local_settled;

        self.link_record_mut(link)?.current = if more { Some(delivery) } else { None };

        if locally_settled {
            if !more {
                self.reclaim.push(delivery);
            }
        } else {
            self.post(Event::Delivery(delivery));
        }
        Ok(())
    }

    /// First frame of a new delivery consumes one unit of credit
    fn incoming_delivery(
        &mut self,
        link: LinkId,
        number: u32,
        tag: DeliveryTag,
    ) -> Result<DeliveryId> {
        let id = DeliveryId(self.allocate_id());
        let record = self.link_record_mut(link)?;
        if record.credit == 0 {
            warn!("Link {} received a transfer without credit", link);
        }
        record.credit = record.credit.saturating_sub(1);
        record.delivery_count = record.delivery_count.wrapping_add(1);
        record.unsettled.insert(number, id);

        self.deliveries.insert(
            id,
            DeliveryRecord {
                link,
                number,
                tag,
                buffer: Vec::new(),
                partial: true,
                local_settled: false,
                remote_settled: false,
                local_outcome: None,
                remote_outcome: None,
            },
        );
        Ok(id)
    }

    fn remote_disposition(
        &mut self,
        link: LinkId,
        number: u32,
        settled: bool,
        outcome: Option<Outcome>,
    ) -> Result<()> {
        let Some(delivery) = self.link_record(link)?.unsettled.get(&number).copied() else {
            trace!("Ignoring disposition for settled delivery {} on link {}", number, link);
            return Ok(());
        };

        let record = self.delivery_record_mut(delivery)?;
        record.remote_settled |= settled;
        if outcome.is_some() {
            record.remote_outcome = outcome;
        }
        self.post(Event::Delivery(delivery));
        Ok(())
    }
}
